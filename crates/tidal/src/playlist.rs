use serde::Deserialize;

use crate::Tidal;
use crate::error::TidalError;
use crate::id::PlaylistId;
use crate::track::{Track, TrackItem};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub uuid: PlaylistId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub number_of_tracks: u32,
    #[serde(default)]
    pub square_image: Option<String>,
}

impl Tidal {
    pub async fn playlist(&self, id: &PlaylistId) -> Result<Playlist, TidalError> {
        self.get(&format!("playlists/{id}"), &[]).await
    }

    /// Playlist tracks in provider order; pagination is transparent.
    pub async fn playlist_tracks(&self, id: &PlaylistId) -> Result<Vec<Track>, TidalError> {
        let items: Vec<TrackItem> = self.paged(&format!("playlists/{id}/items")).await?;
        Ok(items
            .into_iter()
            .filter(|item| item.kind == "track")
            .map(|item| item.item)
            .collect())
    }
}
