use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tidal::TrackId;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch;
use crate::caption;
use crate::link::Link;
use crate::progress::{Tracker, UploadStatus};
use crate::staging::{self, AlbumInfo, ListingInfo, Staging, StagingError, TrackInfo, TrackPaths};
use crate::telegram::{self, InputMediaAudio, Peer, Pool, SendAudio, TelegramError};
use crate::worker::{Interrupted, JobCtx};

/// Cadence of the "uploading audio" liveness broadcast.
const TYPING_PERIOD: Duration = Duration::from_millis(1221);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Telegram(#[from] TelegramError),

    #[error("staging: {0}")]
    Staging(#[from] StagingError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}: not an uploadable file", .path.display())]
    BadMedia { path: PathBuf },

    #[error("upload response carries no file id")]
    NoFileId,

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Publishes staged audio to the configured peer: tracks are uploaded
/// in parallel as silent scratch messages, republished as media groups
/// in input order, and the scratch messages are deleted.
pub struct Uploader {
    pool: Arc<Pool>,
    staging: Staging,
    peer: Peer,
    threads: usize,
    limit: usize,
    pause: Duration,
    signature: Option<String>,
    status: UploadStatus,
}

struct PlannedGroup {
    ids: Vec<TrackId>,
    caption: String,
}

struct GroupItem {
    paths: TrackPaths,
    info: TrackInfo,
    size: u64,
    cover: Option<Bytes>,
}

impl Uploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<Pool>,
        staging: Staging,
        peer: Peer,
        threads: usize,
        limit: usize,
        pause: Duration,
        signature: Option<String>,
        status: UploadStatus,
    ) -> Self {
        Self {
            pool,
            staging,
            peer,
            threads: threads.max(1),
            limit: limit.max(1),
            pause,
            signature,
            status,
        }
    }

    pub async fn run(&self, ctx: &JobCtx, link: &Link) -> Result<(), UploadError> {
        let result = match link {
            Link::Album(id) => self.album(ctx, *id).await,
            Link::Playlist(id) => {
                let paths = self.staging.playlist(id);
                self.listing(ctx, &paths.info).await
            }
            Link::Mix(id) => {
                let paths = self.staging.mix(id);
                self.listing(ctx, &paths.info).await
            }
            Link::Track(id) => self.single(ctx, *id).await,
        };
        self.status.clear();
        result
    }

    /// Albums batch per volume so the volume number survives into every
    /// caption; the album cover is shared by all of its tracks.
    async fn album(&self, ctx: &JobCtx, id: tidal::AlbumId) -> Result<(), UploadError> {
        let paths = self.staging.album(id);
        let info: AlbumInfo = staging::read_json(&paths.info).await?;
        let cover = tokio::fs::read(&paths.cover).await.ok().map(Bytes::from);

        let groups = plan_album_groups(&info, self.signature.as_deref());
        self.send_groups(ctx, groups, cover.as_ref()).await
    }

    async fn listing(&self, ctx: &JobCtx, info_path: &Path) -> Result<(), UploadError> {
        let info: ListingInfo = staging::read_json(info_path).await?;
        let groups = plan_listing_groups(&info, self.signature.as_deref());
        self.send_groups(ctx, groups, None).await
    }

    async fn single(&self, ctx: &JobCtx, id: TrackId) -> Result<(), UploadError> {
        let chat_id = self.peer.chat_id();
        let item = self.prepare(id, None).await?;

        let tracker = Arc::new(Tracker::default());
        tracker.expect(item.size + cover_len(&item));
        self.status.begin(tracker.clone());

        let stop = CancellationToken::new();
        let typing = self.spawn_typing(stop.clone(), ctx.clone(), tracker.clone());

        let caption_text = caption::single_caption(&item.info.caption, self.signature.as_deref());
        let result = async {
            let performer = caption::join_artists(&item.info.artists);
            let file_name = caption::filename(&item.info);
            let mime = probe_mime(&item.paths.audio)
                .await
                .unwrap_or_else(|| item.info.mime_type.clone());

            ctx.guard(telegram::with_flood_retry(|| async {
                let bot = self.pool.checkout();
                bot.send_audio(&SendAudio {
                    chat_id,
                    path: &item.paths.audio,
                    file_name: &file_name,
                    mime: &mime,
                    title: &item.info.title,
                    performer: &performer,
                    duration: item.info.duration,
                    caption: Some(&caption_text),
                    thumbnail: item.cover.as_ref(),
                    tracker: &tracker,
                    read_ahead: self.threads,
                    silent: false,
                })
                .await
            }))
            .await??;

            if let Some(cover) = &item.cover {
                tracker.add(cover.len() as u64);
            }
            Ok::<_, UploadError>(())
        }
        .await;

        stop.cancel();
        typing.await.ok();
        result
    }

    async fn send_groups(
        &self,
        ctx: &JobCtx,
        groups: Vec<PlannedGroup>,
        shared_cover: Option<&Bytes>,
    ) -> Result<(), UploadError> {
        let total = groups.len();
        for (index, group) in groups.into_iter().enumerate() {
            tracing::info!(group = index + 1, total, tracks = group.ids.len(), "sending media group");
            self.send_group(ctx, &group.ids, shared_cover, &group.caption)
                .await?;
            if index + 1 < total {
                ctx.guard(tokio::time::sleep(self.pause)).await?;
            }
        }
        Ok(())
    }

    async fn send_group(
        &self,
        ctx: &JobCtx,
        ids: &[TrackId],
        shared_cover: Option<&Bytes>,
        caption: &str,
    ) -> Result<(), UploadError> {
        let chat_id = self.peer.chat_id();

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            items.push(self.prepare(*id, shared_cover).await?);
        }

        let tracker = Arc::new(Tracker::default());
        for item in &items {
            tracker.expect(item.size + cover_len(item));
        }
        self.status.begin(tracker.clone());

        let stop = CancellationToken::new();
        let typing = self.spawn_typing(stop.clone(), ctx.clone(), tracker.clone());

        let result = self.push_group(ctx, chat_id, &items, &tracker, caption).await;

        stop.cancel();
        typing.await.ok();
        result
    }

    async fn push_group(
        &self,
        ctx: &JobCtx,
        chat_id: i64,
        items: &[GroupItem],
        tracker: &Arc<Tracker>,
        caption: &str,
    ) -> Result<(), UploadError> {
        // every upload settles before the batch is judged, so anything
        // that reached the server is in `scratch` and can be deleted;
        // an aborted sibling would otherwise linger as a stray message
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let uploads = items.iter().map(|item| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.clone().acquire_owned().await.unwrap();
                match ctx.guard(self.upload_item(chat_id, item, tracker)).await {
                    Ok(result) => result,
                    Err(interrupted) => Err(interrupted.into()),
                }
            }
        });

        let (scratch, failed) = settle(futures::future::join_all(uploads).await);
        if let Some(err) = failed {
            self.delete_scratch(chat_id, &scratch).await;
            return Err(err);
        }

        let media = group_media(&scratch, caption);
        let sent = match ctx
            .guard(telegram::with_flood_retry(|| async {
                let bot = self.pool.checkout();
                bot.send_media_group(chat_id, &media).await
            }))
            .await
        {
            Ok(Ok(sent)) => sent,
            Ok(Err(err)) => {
                self.delete_scratch(chat_id, &scratch).await;
                return Err(err.into());
            }
            Err(interrupted) => {
                self.delete_scratch(chat_id, &scratch).await;
                return Err(interrupted.into());
            }
        };
        tracing::debug!(messages = sent.len(), "media group sent");

        // the scratch messages were only file-id carriers
        self.delete_scratch(chat_id, &scratch).await;
        Ok(())
    }

    async fn delete_scratch(&self, chat_id: i64, scratch: &[(i64, String)]) {
        if scratch.is_empty() {
            return;
        }
        let message_ids: Vec<i64> = scratch.iter().map(|(id, _)| *id).collect();
        let bot = self.pool.checkout();
        if let Err(err) = bot.delete_messages(chat_id, &message_ids).await {
            tracing::warn!(error = %err, "failed to delete scratch messages");
        }
    }

    async fn upload_item(
        &self,
        chat_id: i64,
        item: &GroupItem,
        tracker: &Arc<Tracker>,
    ) -> Result<(i64, String), UploadError> {
        let performer = caption::join_artists(&item.info.artists);
        let file_name = caption::filename(&item.info);
        let mime = probe_mime(&item.paths.audio)
            .await
            .unwrap_or_else(|| item.info.mime_type.clone());

        let message = telegram::with_flood_retry(|| async {
            let bot = self.pool.checkout();
            bot.send_audio(&SendAudio {
                chat_id,
                path: &item.paths.audio,
                file_name: &file_name,
                mime: &mime,
                title: &item.info.title,
                performer: &performer,
                duration: item.info.duration,
                caption: None,
                thumbnail: item.cover.as_ref(),
                tracker,
                read_ahead: self.threads,
                silent: true,
            })
            .await
        })
        .await?;

        if let Some(cover) = &item.cover {
            tracker.add(cover.len() as u64);
        }

        let file_id = message.file_id().ok_or(UploadError::NoFileId)?.to_owned();
        Ok((message.message_id, file_id))
    }

    /// Every media file must be a non-empty regular file before anything
    /// is sent.
    async fn prepare(
        &self,
        id: TrackId,
        shared_cover: Option<&Bytes>,
    ) -> Result<GroupItem, UploadError> {
        let paths = self.staging.track(id);
        let info: TrackInfo = staging::read_json(&paths.info).await?;
        let size = staging::file_size(&paths.audio)
            .await
            .filter(|size| *size > 0)
            .ok_or_else(|| UploadError::BadMedia {
                path: paths.audio.clone(),
            })?;

        let cover = match shared_cover {
            Some(bytes) => Some(bytes.clone()),
            None => tokio::fs::read(&paths.cover).await.ok().map(Bytes::from),
        };

        Ok(GroupItem {
            paths,
            info,
            size,
            cover,
        })
    }

    fn spawn_typing(
        &self,
        stop: CancellationToken,
        ctx: JobCtx,
        tracker: Arc<Tracker>,
    ) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let chat_id = self.peer.chat_id();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TYPING_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ctx.cancelled() => break,
                    _ = tick.tick() => {
                        if tracker.done() {
                            break;
                        }
                        tracing::debug!(percent = tracker.percent(), "uploading audio");
                        let bot = pool.checkout();
                        // drops are tolerated
                        bot.send_chat_action(chat_id, "upload_document").await.ok();
                    }
                }
            }
        })
    }
}

/// One planned media group per volume (albums) or per listing slice,
/// with the volume and part numbering already baked into the caption.
fn plan_album_groups(info: &AlbumInfo, signature: Option<&str>) -> Vec<PlannedGroup> {
    let mut groups = Vec::new();
    for (volume_index, ids) in info.volume_track_ids.iter().enumerate() {
        let split = batch::split(ids.clone());
        let parts = split.len();
        for (part_index, part) in split.into_iter().enumerate() {
            groups.push(PlannedGroup {
                ids: part,
                caption: caption::group_caption(
                    &info.caption,
                    Some(volume_index as u32 + 1),
                    (part_index + 1, parts),
                    signature,
                ),
            });
        }
    }
    groups
}

fn plan_listing_groups(info: &ListingInfo, signature: Option<&str>) -> Vec<PlannedGroup> {
    let split = batch::split(info.track_ids.clone());
    let parts = split.len();
    split
        .into_iter()
        .enumerate()
        .map(|(part_index, ids)| PlannedGroup {
            ids,
            caption: caption::group_caption(&info.caption, None, (part_index + 1, parts), signature),
        })
        .collect()
}

/// Splits settled upload results into the completed scratch entries,
/// still in input order, and the first failure if any.
fn settle(
    results: Vec<Result<(i64, String), UploadError>>,
) -> (Vec<(i64, String)>, Option<UploadError>) {
    let mut scratch = Vec::with_capacity(results.len());
    let mut failed = None;
    for result in results {
        match result {
            Ok(entry) => scratch.push(entry),
            Err(err) => failed = failed.or(Some(err)),
        }
    }
    (scratch, failed)
}

/// Group items in scratch-upload order; only the last one carries the
/// caption.
fn group_media<'a>(scratch: &'a [(i64, String)], caption: &'a str) -> Vec<InputMediaAudio<'a>> {
    scratch
        .iter()
        .enumerate()
        .map(|(index, (_, file_id))| {
            let text = if index + 1 == scratch.len() { caption } else { "" };
            InputMediaAudio::new(file_id, text)
        })
        .collect()
}

fn cover_len(item: &GroupItem) -> u64 {
    item.cover.as_ref().map_or(0, |cover| cover.len() as u64)
}

/// Sniffs the staged file head for the real container; the manifest
/// mime type is the fallback.
async fn probe_mime(path: &Path) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut head = [0u8; 12];
    let n = file.read(&mut head).await.ok()?;
    let head = &head[..n];

    if head.starts_with(b"fLaC") {
        return Some("audio/flac".to_owned());
    }
    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        return Some("audio/mp4".to_owned());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album_info(volumes: &[usize]) -> AlbumInfo {
        let mut next = 0u64;
        AlbumInfo {
            caption: "Artist - Album".to_owned(),
            volume_track_ids: volumes
                .iter()
                .map(|count| {
                    (0..*count)
                        .map(|_| {
                            next += 1;
                            TrackId::from(next)
                        })
                        .collect()
                })
                .collect(),
        }
    }

    #[test]
    fn album_groups_batch_per_volume() {
        // 23 tracks over volumes of 10 and 13
        let groups = plan_album_groups(&album_info(&[10, 13]), None);

        let sizes: Vec<usize> = groups.iter().map(|group| group.ids.len()).collect();
        assert_eq!(sizes, vec![10, 7, 6]);

        assert!(groups[0].caption.ends_with("<i>Volume: 1, Part: 1/1</i>"));
        assert!(groups[1].caption.ends_with("<i>Volume: 2, Part: 1/2</i>"));
        assert!(groups[2].caption.ends_with("<i>Volume: 2, Part: 2/2</i>"));
    }

    #[test]
    fn listing_groups_number_across_the_whole_listing() {
        let info = ListingInfo {
            caption: "road trip".to_owned(),
            track_ids: (1..=7).map(TrackId::from).collect(),
        };
        let groups = plan_listing_groups(&info, None);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids.len(), 7);
        assert!(groups[0].caption.ends_with("<i>Part: 1/1</i>"));
    }

    #[test]
    fn signature_lands_on_every_group_caption() {
        let groups = plan_album_groups(&album_info(&[13]), Some("<b>sig</b>"));
        assert_eq!(groups.len(), 2);
        for group in &groups {
            assert!(group.caption.ends_with("<b>sig</b>"));
        }
    }

    #[test]
    fn settle_keeps_completed_entries_and_the_first_failure() {
        let results = vec![
            Ok((1, "a".to_owned())),
            Err(UploadError::NoFileId),
            Ok((3, "c".to_owned())),
            Err(UploadError::Interrupted(Interrupted::Job)),
        ];
        let (scratch, failed) = settle(results);

        // completed uploads stay deletable even though the batch failed
        assert_eq!(scratch, vec![(1, "a".to_owned()), (3, "c".to_owned())]);
        assert!(matches!(failed, Some(UploadError::NoFileId)));
    }

    #[test]
    fn settle_without_failures_keeps_input_order() {
        let results: Vec<Result<(i64, String), UploadError>> =
            (0..4).map(|i| Ok((i, format!("file-{i}")))).collect();
        let (scratch, failed) = settle(results);
        assert!(failed.is_none());
        assert_eq!(
            scratch.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn only_the_last_group_item_carries_the_caption() {
        let scratch: Vec<(i64, String)> = (0..5).map(|i| (i, format!("file-{i}"))).collect();
        let media = group_media(&scratch, "the caption");

        let values: Vec<serde_json::Value> = media
            .iter()
            .map(|item| serde_json::to_value(item).unwrap())
            .collect();
        for value in &values[..4] {
            assert!(value.get("caption").is_none());
        }
        assert_eq!(values[4]["caption"], "the caption");
        assert_eq!(values[4]["media"], "file-4");
    }
}
