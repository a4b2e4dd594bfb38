use std::sync::Arc;

use serde::Deserialize;

use crate::Tidal;
use crate::artist::Artist;
use crate::error::TidalError;
use crate::id::AlbumId;
use crate::track::{Track, TrackItem};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub id: AlbumId,
    pub title: String,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub artists: Vec<Artist>,
    pub number_of_tracks: u32,
    #[serde(default = "default_volumes")]
    pub number_of_volumes: u32,
    #[serde(default)]
    pub release_date: Option<chrono::NaiveDate>,
}

/// Album metadata together with its track lists, one per volume, in
/// provider order.
#[derive(Debug, Clone)]
pub struct AlbumDetails {
    pub info: Album,
    pub volumes: Vec<Vec<Track>>,
}

fn default_volumes() -> u32 {
    1
}

impl Tidal {
    /// Album metadata plus per-volume track lists, cached for an hour.
    pub async fn album(&self, id: AlbumId) -> Result<Arc<AlbumDetails>, TidalError> {
        let this = self.clone();
        self.albums_cache()
            .try_get_with(id, async move {
                let info: Album = this.get(&format!("albums/{id}"), &[]).await?;
                let items: Vec<TrackItem> = this.paged(&format!("albums/{id}/items")).await?;

                let mut volumes: Vec<Vec<Track>> = Vec::new();
                for item in items {
                    if item.kind != "track" {
                        tracing::debug!(kind = %item.kind, "skipping non-track album item");
                        continue;
                    }
                    let volume = item.item.volume_number.max(1) as usize;
                    while volumes.len() < volume {
                        volumes.push(Vec::new());
                    }
                    volumes[volume - 1].push(item.item);
                }

                Ok(Arc::new(AlbumDetails { info, volumes }))
            })
            .await
            .map_err(TidalError::shared)
    }
}
