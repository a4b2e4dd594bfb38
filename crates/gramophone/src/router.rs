use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tidal::{Tidal, TidalError};
use tokio_util::sync::CancellationToken;
use unicode_ellipsis::truncate_str;

use crate::caption;
use crate::download::{DownloadError, Downloader};
use crate::link::{self, Link, LinkError};
use crate::login::{LoginError, LoginFlow};
use crate::progress::UploadStatus;
use crate::telegram::{Message, Pool, TelegramError};
use crate::upload::{UploadError, Uploader};
use crate::worker::{Interrupted, JobSlot, Worker};

/// How much of an unexpected error string is echoed to the operator.
const ERROR_PREVIEW: usize = 300;

#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Thin adapter between chat updates and the worker, downloader,
/// uploader and login flow. Stateless apart from the update offset.
pub struct Router {
    pub pool: Arc<Pool>,
    pub tidal: Tidal,
    pub worker: Worker,
    pub downloader: Arc<Downloader>,
    pub uploader: Arc<Uploader>,
    pub login: Arc<LoginFlow>,
    pub admin_id: i64,
    pub state_path: PathBuf,
    pub status: UploadStatus,
    pub shutdown: CancellationToken,
}

impl Router {
    /// Long-polls updates until shutdown. The consumed offset is
    /// persisted so restarts do not replay old commands.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut offset = read_offset(&self.state_path).await;
        tracing::info!(offset, "listening for updates");

        loop {
            let bot = self.pool.checkout();
            let updates = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                updates = bot.get_updates(offset) => updates,
            };
            drop(bot);

            let updates = match updates {
                Ok(updates) => updates,
                Err(err) => {
                    tracing::warn!(error = %err, "getUpdates failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if updates.is_empty() {
                continue;
            }
            for update in updates {
                offset = offset.max(update.update_id + 1);
                if let Some(message) = update.message {
                    self.handle(message).await;
                }
            }
            persist_offset(&self.state_path, offset).await;
        }
    }

    async fn handle(&self, message: Message) {
        let Some(from) = message.from else { return };
        let Some(text) = message.text else { return };
        let text = text.trim().to_owned();
        let chat_id = message.chat.id;

        if text == "/start" {
            // the one command that greets anybody
            let greeting = format!(
                "hi {}! send me a tidal link and i'll mirror it here.",
                caption::escape(&from.first_name),
            );
            self.reply(chat_id, &greeting).await;
            return;
        }

        if from.id != self.admin_id {
            tracing::debug!(user = from.id, "dropping message from non-operator");
            return;
        }

        match text.as_str() {
            "/cancel" => {
                self.worker.cancel();
                self.reply(chat_id, "cancel requested.").await;
            }
            "/status" => self.report_status(chat_id).await,
            "/authorize" => self.authorize(chat_id).await,
            _ => self.mirror(chat_id, &text).await,
        }
    }

    async fn report_status(&self, chat_id: i64) {
        let auth = if self.tidal.store().authorized().await {
            "authorized"
        } else {
            "not authorized, send /authorize"
        };
        let job = if self.worker.running() {
            match self.status.percent() {
                Some(percent) => format!("running, uploading audio {percent}%"),
                None => "running, downloading".to_owned(),
            }
        } else {
            "idle".to_owned()
        };
        self.reply(chat_id, &format!("provider: {auth}\njob: {job}"))
            .await;
    }

    async fn authorize(&self, chat_id: i64) {
        match self.login.initiate(self.shutdown.clone()).await {
            Ok((link, waiter)) => {
                self.reply(
                    chat_id,
                    &format!("open this link to authorize: {}", caption::escape(&link)),
                )
                .await;

                // report the outcome without blocking the update loop
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    let Ok(outcome) = waiter.await else { return };
                    let text = match outcome {
                        Ok(()) => "authorized, you can send links now.".to_owned(),
                        Err(LoginError::Tidal(TidalError::LoginLinkExpired)) => {
                            "the login link expired, send /authorize again.".to_owned()
                        }
                        Err(LoginError::Interrupted(_)) => return,
                        Err(err) => format!(
                            "authorization failed: {}",
                            caption::code(&truncate_str(&err.to_string(), ERROR_PREVIEW)),
                        ),
                    };
                    pool.checkout().send_message(chat_id, &text).await.ok();
                });
            }
            Err(LoginError::InProgress) => {
                self.reply(chat_id, "an authorization is already in progress.")
                    .await;
            }
            Err(err) => {
                self.reply(
                    chat_id,
                    &format!(
                        "could not start the authorization: {}",
                        caption::code(&truncate_str(&err.to_string(), ERROR_PREVIEW)),
                    ),
                )
                .await;
            }
        }
    }

    async fn mirror(&self, chat_id: i64, text: &str) {
        let link = match link::parse(text) {
            Ok(link) => link,
            Err(LinkError::UnsupportedArtist) => {
                self.reply(chat_id, "artist links are not supported.").await;
                return;
            }
            Err(LinkError::UnsupportedVideo) => {
                self.reply(chat_id, "video links are not supported.").await;
                return;
            }
            Err(LinkError::NotALink) => {
                self.reply(chat_id, "send me a tidal album, playlist, mix or track link.")
                    .await;
                return;
            }
        };

        let Some(slot) = self.worker.try_acquire() else {
            self.reply(chat_id, "another download is in progress.").await;
            return;
        };

        match self.plan(&link).await {
            Ok(plan) => self.reply(chat_id, &plan).await,
            Err(TidalError::LoginRequired) => {
                self.reply(chat_id, "you need to authorize first, send /authorize.")
                    .await;
                return; // slot drops, releasing the gate
            }
            Err(err) => {
                self.reply(
                    chat_id,
                    &format!(
                        "could not resolve the link: {}",
                        caption::code(&truncate_str(&err.to_string(), ERROR_PREVIEW)),
                    ),
                )
                .await;
                return;
            }
        }

        let tidal = self.tidal.clone();
        let downloader = self.downloader.clone();
        let uploader = self.uploader.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            // the inner task keeps a panic from leaking the final reply;
            // the slot itself is released by unwinding
            let job = tokio::spawn(run_job(
                tidal,
                downloader,
                uploader,
                pool.clone(),
                chat_id,
                link,
                slot,
            ));
            if let Err(err) = job.await {
                if err.is_panic() {
                    tracing::error!("job task panicked");
                    pool.checkout()
                        .send_message(chat_id, "something went wrong, the job was aborted.")
                        .await
                        .ok();
                }
            }
        });
    }

    /// Planned-items reply sent right after admission.
    async fn plan(&self, link: &Link) -> Result<String, TidalError> {
        Ok(match link {
            Link::Album(id) => {
                let details = self.tidal.album(*id).await?;
                let tracks: usize = details.volumes.iter().map(Vec::len).sum();
                format!(
                    "mirroring album {}: {} tracks in {} volume(s).",
                    caption::escape(&details.info.title),
                    tracks,
                    details.volumes.len().max(1),
                )
            }
            Link::Playlist(id) => {
                let playlist = self.tidal.playlist(id).await?;
                format!(
                    "mirroring playlist {}: {} tracks.",
                    caption::escape(&playlist.title),
                    playlist.number_of_tracks,
                )
            }
            Link::Mix(id) => format!("mirroring mix {id}."),
            Link::Track(id) => {
                let track = self.tidal.track(*id).await?;
                format!("mirroring track {}.", caption::escape(&track.title))
            }
        })
    }

    async fn reply(&self, chat_id: i64, html: &str) {
        if let Err(err) = self.pool.checkout().send_message(chat_id, html).await {
            tracing::warn!(error = %err, "failed to send reply");
        }
    }
}

async fn run_job(
    tidal: Tidal,
    downloader: Arc<Downloader>,
    uploader: Arc<Uploader>,
    pool: Arc<Pool>,
    chat_id: i64,
    link: Link,
    slot: JobSlot,
) {
    let ctx = slot.ctx().clone();
    let started = std::time::Instant::now();

    let result: Result<(), JobError> = async {
        downloader.run(&ctx, &link).await?;
        uploader.run(&ctx, &link).await?;
        Ok(())
    }
    .await;

    // one-shot advisory, surfaced at most once per rotation
    if tidal.store().take_refresh_advisory() {
        pool.checkout()
            .send_message(
                chat_id,
                "note: the provider token was refreshed mid-job; retry if something failed.",
            )
            .await
            .ok();
    }

    let text = match &result {
        Ok(()) => {
            tracing::info!(elapsed = ?started.elapsed(), "job finished");
            "done.".to_owned()
        }
        Err(err) => {
            tracing::error!(error = %err, "job failed");
            describe(err)
        }
    };
    pool.checkout().send_message(chat_id, &text).await.ok();

    drop(slot);
}

/// Sentinels first, then a generic failure with the error string in a
/// code block.
fn describe(err: &JobError) -> String {
    match err {
        JobError::Download(DownloadError::Tidal(TidalError::LoginRequired)) => {
            "the provider session is gone, send /authorize.".to_owned()
        }
        JobError::Download(DownloadError::Interrupted(cause))
        | JobError::Upload(UploadError::Interrupted(cause)) => match cause {
            Interrupted::Job => "canceled.".to_owned(),
            Interrupted::Shutdown => "shutting down, the job was aborted.".to_owned(),
        },
        JobError::Upload(UploadError::Telegram(TelegramError::FloodWait(retry_after))) => {
            format!(
                "the messaging service kept throttling us (retry after {}s), try again later.",
                retry_after.as_secs(),
            )
        }
        other => format!(
            "the job failed: {}",
            caption::code(&truncate_str(&other.to_string(), ERROR_PREVIEW)),
        ),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    offset: i64,
}

async fn read_offset(path: &Path) -> i64 {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return 0;
    };
    serde_json::from_slice::<State>(&bytes)
        .map(|state| state.offset)
        .unwrap_or_default()
}

async fn persist_offset(path: &Path, offset: i64) {
    let state = State { offset };
    let bytes = match serde_json::to_vec(&state) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };
    if let Err(err) = tokio::fs::write(path, bytes).await {
        tracing::warn!(error = %err, "failed to persist the update offset");
    }
}
