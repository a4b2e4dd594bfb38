use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use bytesize::ByteSize;
use futures::StreamExt;
use thiserror::Error;
use tidal::{AlbumId, Manifest, MixId, PlaylistId, Tidal, TidalError, Track, TrackId};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_retry::{
    Retry,
    strategy::{ExponentialBackoff, jitter},
};

use crate::caption;
use crate::link::Link;
use crate::staging::{self, AlbumInfo, Credit, ListingInfo, Staging, StagingError, TrackInfo};
use crate::worker::{Interrupted, JobCtx};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Tidal(#[from] TidalError),

    #[error("staging: {0}")]
    Staging(#[from] StagingError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Materializes a link's audio, artwork and info records on disk.
pub struct Downloader {
    tidal: Tidal,
    staging: Staging,
    track_concurrency: usize,
    segment_concurrency: usize,
}

impl Downloader {
    pub fn new(
        tidal: Tidal,
        staging: Staging,
        track_concurrency: usize,
        segment_concurrency: usize,
    ) -> Self {
        Self {
            tidal,
            staging,
            track_concurrency: track_concurrency.max(1),
            segment_concurrency: segment_concurrency.max(1),
        }
    }

    pub async fn run(&self, ctx: &JobCtx, link: &Link) -> Result<(), DownloadError> {
        match link {
            Link::Album(id) => self.album(ctx, *id).await,
            Link::Playlist(id) => self.playlist(ctx, id).await,
            Link::Mix(id) => self.mix(ctx, id).await,
            Link::Track(id) => self.single(ctx, *id).await,
        }
    }

    async fn album(&self, ctx: &JobCtx, id: AlbumId) -> Result<(), DownloadError> {
        let details = ctx.guard(self.tidal.album(id)).await??;
        let paths = self.staging.album(id);

        let info = AlbumInfo {
            caption: format!(
                "{} - {}",
                caption::join_artists(&credits(&details.info.artists)),
                details.info.title,
            ),
            volume_track_ids: details
                .volumes
                .iter()
                .map(|volume| volume.iter().map(|track| track.id).collect())
                .collect(),
        };
        staging::write(&paths.info, &serde_json::to_vec_pretty(&info)?).await?;

        // one shared cover for the whole album
        if let Some(cover_id) = details.info.cover.as_deref() {
            let cover = ctx.guard(self.tidal.cover(cover_id)).await??;
            staging::write(&paths.cover, &cover).await?;
        } else {
            tracing::warn!(album = %id, "album has no cover");
        }

        for (index, volume) in details.volumes.iter().enumerate() {
            tracing::info!(album = %id, volume = index + 1, tracks = volume.len(), "downloading volume");
            self.tracks(ctx, volume, false).await?;
        }
        Ok(())
    }

    async fn playlist(&self, ctx: &JobCtx, id: &PlaylistId) -> Result<(), DownloadError> {
        let playlist = ctx.guard(self.tidal.playlist(id)).await??;
        let tracks = ctx.guard(self.tidal.playlist_tracks(id)).await??;
        let paths = self.staging.playlist(id);

        let info = ListingInfo {
            caption: playlist.title,
            track_ids: tracks.iter().map(|track| track.id).collect(),
        };
        staging::write(&paths.info, &serde_json::to_vec_pretty(&info)?).await?;

        tracing::info!(playlist = %id, tracks = tracks.len(), "downloading playlist");
        self.tracks(ctx, &tracks, true).await
    }

    async fn mix(&self, ctx: &JobCtx, id: &MixId) -> Result<(), DownloadError> {
        let tracks = ctx.guard(self.tidal.mix_tracks(id)).await??;
        let paths = self.staging.mix(id);

        let info = ListingInfo {
            caption: format!("Mix {id}"),
            track_ids: tracks.iter().map(|track| track.id).collect(),
        };
        staging::write(&paths.info, &serde_json::to_vec_pretty(&info)?).await?;

        tracing::info!(mix = %id, tracks = tracks.len(), "downloading mix");
        self.tracks(ctx, &tracks, true).await
    }

    async fn single(&self, ctx: &JobCtx, id: TrackId) -> Result<(), DownloadError> {
        let track = ctx.guard(self.tidal.track(id)).await??;
        self.track(ctx, &track, true).await
    }

    /// Downloads a set of tracks with bounded concurrency. A track
    /// failure fails the whole job, but only after every sibling has
    /// settled; cancellation still cuts each download through its own
    /// context guards.
    async fn tracks(
        &self,
        ctx: &JobCtx,
        tracks: &[Track],
        with_cover: bool,
    ) -> Result<(), DownloadError> {
        run_all(
            tracks.iter().map(|track| self.track(ctx, track, with_cover)),
            self.track_concurrency,
        )
        .await
    }

    async fn track(
        &self,
        ctx: &JobCtx,
        track: &Track,
        with_cover: bool,
    ) -> Result<(), DownloadError> {
        let paths = self.staging.track(track.id);
        let manifest = ctx.guard(self.tidal.manifest(track.id)).await??;
        let extension = manifest.extension()?;

        // idempotent resume: a non-empty staged file is kept as is
        if staging::file_size(&paths.audio).await.unwrap_or(0) > 0 {
            tracing::info!(track = %track.id, "audio already staged, skipping segments");
        } else {
            self.fetch_audio(ctx, &manifest, &paths.audio).await?;
            let size = staging::file_size(&paths.audio).await.unwrap_or(0);
            tracing::info!(
                track = %track.id,
                size = %ByteSize(size),
                segments = manifest.segments.len(),
                "track staged"
            );
        }

        let info = TrackInfo {
            title: track.title.clone(),
            version: track.version.clone(),
            artists: credits(&track.artists),
            duration: track.duration,
            cover_id: track.cover_id().map(str::to_owned),
            mime_type: manifest.mime_type.clone(),
            codec: manifest.codec.clone(),
            extension: extension.to_owned(),
            caption: format!(
                "{} - {}",
                caption::join_artists(&credits(&track.artists)),
                caption::titled(&track.title, track.version.as_deref()),
            ),
        };
        staging::write(&paths.info, &serde_json::to_vec_pretty(&info)?).await?;

        if with_cover {
            if let Some(cover_id) = track.cover_id() {
                let cover = ctx.guard(self.tidal.cover(cover_id)).await??;
                staging::write(&paths.cover, &cover).await?;
            }
        }
        Ok(())
    }

    /// Segments are fetched concurrently but land in strict ascending
    /// index order. Encrypted containers are decrypted after
    /// concatenation, before anything touches the staging path.
    async fn fetch_audio(
        &self,
        ctx: &JobCtx,
        manifest: &Manifest,
        path: &Path,
    ) -> Result<(), DownloadError> {
        let mut segments = futures::stream::iter(manifest.segments.iter().cloned().map(|url| {
            let strategy = ExponentialBackoff::from_millis(1000).map(jitter).take(3);
            Retry::spawn(strategy, move || {
                let url = url.clone();
                async move { self.tidal.segment(&url).await }
            })
        }))
        .buffered(self.segment_concurrency);

        if let Some(key_id) = manifest.key_id.as_deref() {
            let mut data = Vec::new();
            while let Some(chunk) = ctx.guard(segments.next()).await? {
                data.extend_from_slice(&chunk?);
            }
            tidal::decrypt_track(key_id, &mut data)?;
            staging::write(path, &data).await?;
            return Ok(());
        }

        let mut file = tokio::fs::File::create(path).await?;
        let written = async {
            while let Some(chunk) = ctx.guard(segments.next()).await? {
                file.write_all(&chunk?).await?;
            }
            file.sync_all().await?;
            Ok::<_, DownloadError>(())
        }
        .await;

        if let Err(err) = written {
            staging::remove(path).await.ok();
            return Err(err);
        }
        Ok(())
    }
}

fn credits(artists: &[tidal::Artist]) -> Vec<Credit> {
    artists
        .iter()
        .map(|artist| Credit {
            name: artist.name.clone(),
            role: artist.role,
        })
        .collect()
}

/// Drives every download to completion with at most `concurrency` in
/// flight. A failing download must not tear down a sibling mid-write
/// (a dropped future never reaches its remove-partial branch), so the
/// first failure is reported only once everything has settled.
async fn run_all<I, F>(downloads: I, concurrency: usize) -> Result<(), DownloadError>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<(), DownloadError>>,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let bounded = downloads.into_iter().map(|download| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.clone().acquire_owned().await.unwrap();
            download.await
        }
    });

    let mut first = Ok(());
    for result in futures::future::join_all(bounded).await {
        if result.is_err() && first.is_ok() {
            first = result;
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn failing_download_leaves_no_sibling_partials_behind() {
        let dir = tempfile::tempdir().unwrap();
        let sibling = dir.path().join("7");
        let settled = Arc::new(AtomicUsize::new(0));

        let fail_fast: BoxFuture<'_, Result<(), DownloadError>> = Box::pin(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(DownloadError::Io(std::io::Error::other(
                "segment fetch failed",
            )))
        });

        // mimics the streaming write path: bytes land on disk first,
        // and this download's own failure removes the partial
        let slow_write: BoxFuture<'_, Result<(), DownloadError>> = {
            let sibling = sibling.clone();
            let settled = settled.clone();
            Box::pin(async move {
                tokio::fs::write(&sibling, b"partial").await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
                staging::remove(&sibling).await.ok();
                settled.fetch_add(1, Ordering::SeqCst);
                Err(DownloadError::Io(std::io::Error::other("late failure")))
            })
        };

        let out = run_all(vec![fail_fast, slow_write], 2).await;

        // the early failure wins, but the sibling still ran its own
        // error path instead of being dropped mid-write
        assert!(out.unwrap_err().to_string().contains("segment fetch failed"));
        assert_eq!(settled.load(Ordering::SeqCst), 1);
        assert!(!staging::exists(&sibling).await);
    }

    #[tokio::test]
    async fn run_all_succeeds_when_every_download_does() {
        let downloads: Vec<BoxFuture<'static, Result<(), DownloadError>>> = (0..8)
            .map(|_| {
                let download: BoxFuture<'static, Result<(), DownloadError>> =
                    Box::pin(async { Ok(()) });
                download
            })
            .collect();
        assert!(run_all(downloads, 3).await.is_ok());
    }
}
