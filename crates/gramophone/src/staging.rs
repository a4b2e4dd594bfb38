use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tidal::{ArtistRole, TrackId};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Deterministic per-job layout under the downloads root. Filenames are
/// content ids, never titles; human-readable names are built at upload
/// time from the info records.
#[derive(Debug, Clone)]
pub struct Staging {
    root: PathBuf,
}

/// Paths for a listing-level resource (album, playlist, mix).
#[derive(Debug, Clone)]
pub struct ListingPaths {
    pub info: PathBuf,
    pub cover: PathBuf,
}

/// Paths for one track's artifacts.
#[derive(Debug, Clone)]
pub struct TrackPaths {
    pub audio: PathBuf,
    pub info: PathBuf,
    pub cover: PathBuf,
}

impl Staging {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> Result<(), StagingError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub fn album(&self, id: tidal::AlbumId) -> ListingPaths {
        self.listing(&id.to_string())
    }

    pub fn playlist(&self, id: &tidal::PlaylistId) -> ListingPaths {
        self.listing(id.as_str())
    }

    pub fn mix(&self, id: &tidal::MixId) -> ListingPaths {
        self.listing(id.as_str())
    }

    pub fn track(&self, id: TrackId) -> TrackPaths {
        let id = id.to_string();
        TrackPaths {
            audio: self.root.join(&id),
            info: self.root.join(format!("{id}.json")),
            cover: self.root.join(format!("{id}.jpg")),
        }
    }

    fn listing(&self, id: &str) -> ListingPaths {
        ListingPaths {
            info: self.root.join(format!("{id}.json")),
            cover: self.root.join(format!("{id}.jpg")),
        }
    }
}

/// Writes `bytes` to `path` and fsyncs. A failed write removes the
/// partial file before surfacing, so a file at the destination always
/// means a completed write.
pub async fn write(path: &Path, bytes: &[u8]) -> Result<(), StagingError> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await?;

    let written = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;

    if let Err(err) = written {
        if let Err(removal) = remove(path).await {
            return Err(std::io::Error::new(
                err.kind(),
                format!("{err}; removing the partial file also failed: {removal}"),
            )
            .into());
        }
        return Err(err.into());
    }
    Ok(())
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StagingError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Non-existence is not an error.
pub async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Size of a regular file at `path`, if there is one.
pub async fn file_size(path: &Path) -> Option<u64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    meta.is_file().then(|| meta.len())
}

/// Non-existence is not an error.
pub async fn remove(path: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Album info record: track ids stay grouped per volume because volume
/// numbering survives into the captions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumInfo {
    pub caption: String,
    pub volume_track_ids: Vec<Vec<TrackId>>,
}

/// Playlist and mix info record; order is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingInfo {
    pub caption: String,
    pub track_ids: Vec<TrackId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credit {
    pub name: String,
    pub role: ArtistRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub version: Option<String>,
    pub artists: Vec<Credit>,
    pub duration: u32,
    pub cover_id: Option<String>,
    pub mime_type: String,
    pub codec: String,
    pub extension: String,
    pub caption: String,
}
