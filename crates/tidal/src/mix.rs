use crate::Tidal;
use crate::error::TidalError;
use crate::id::MixId;
use crate::track::{Track, TrackItem};

impl Tidal {
    /// Mix tracks in provider order. Mixes have no standalone metadata
    /// endpoint; callers caption them by id.
    pub async fn mix_tracks(&self, id: &MixId) -> Result<Vec<Track>, TidalError> {
        let items: Vec<TrackItem> = self.paged(&format!("mixes/{id}/items")).await?;
        Ok(items
            .into_iter()
            .filter(|item| item.kind == "track")
            .map(|item| item.item)
            .collect())
    }
}
