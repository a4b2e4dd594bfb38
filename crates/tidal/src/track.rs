use std::sync::Arc;

use serde::Deserialize;

use crate::Tidal;
use crate::artist::Artist;
use crate::error::TidalError;
use crate::id::{AlbumId, TrackId};
use crate::manifest::Manifest;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    #[serde(default)]
    pub version: Option<String>,
    pub duration: u32,
    #[serde(default = "default_number")]
    pub track_number: u32,
    #[serde(default = "default_number")]
    pub volume_number: u32,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub album: Option<AlbumSummary>,
}

impl Track {
    /// Cover id of the album the track belongs to, if any.
    pub fn cover_id(&self) -> Option<&str> {
        self.album.as_ref()?.cover.as_deref()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumSummary {
    pub id: AlbumId,
    pub title: String,
    #[serde(default)]
    pub cover: Option<String>,
}

/// One entry of a paginated `…/items` listing. Albums and playlists can
/// interleave videos with tracks; callers filter on `kind`.
#[derive(Debug, Deserialize)]
pub(crate) struct TrackItem {
    pub item: Track,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackInfo {
    manifest_mime_type: String,
    manifest: String,
}

fn default_number() -> u32 {
    1
}

impl Tidal {
    /// Track metadata by id, cached for an hour.
    pub async fn track(&self, id: TrackId) -> Result<Arc<Track>, TidalError> {
        let this = self.clone();
        self.tracks_cache()
            .try_get_with(id, async move {
                let track: Track = this.get(&format!("tracks/{id}"), &[]).await?;
                Ok(Arc::new(track))
            })
            .await
            .map_err(TidalError::shared)
    }

    /// Stream manifest for a track at the configured quality, already
    /// flattened into an ordered segment fetch list.
    pub async fn manifest(&self, id: TrackId) -> Result<Manifest, TidalError> {
        let info: PlaybackInfo = self
            .get(
                &format!("tracks/{id}/playbackinfopostpaywall"),
                &[
                    ("audioquality", self.quality().as_str().to_owned()),
                    ("playbackmode", "STREAM".to_owned()),
                    ("assetpresentation", "FULL".to_owned()),
                ],
            )
            .await?;
        Manifest::parse(&info.manifest_mime_type, &info.manifest)
    }
}
