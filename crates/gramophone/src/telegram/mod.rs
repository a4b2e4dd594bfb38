mod client;
mod pool;
mod types;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_retry::strategy::FibonacciBackoff;

pub use client::{Bot, SendAudio};
pub use pool::{Pool, Session};
pub use types::{InputMediaAudio, Message, Peer, PeerKind, Update, User};

/// Server-defined maximum upload part size.
pub const UPLOAD_PART: usize = 512 * 1024;

const MAX_SEND_ATTEMPTS: usize = 7;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("flood wait, retry after {0:?}")]
    FloodWait(Duration),

    #[error("api error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ok response without a result")]
    Empty,
}

/// Runs a send until it sticks. Server-dictated flood waits sleep
/// `retry_after` plus a second; anything else backs off on the
/// fibonacci schedule. Gives up after [`MAX_SEND_ATTEMPTS`].
pub async fn with_flood_retry<T, F, Fut>(op: F) -> Result<T, TelegramError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TelegramError>>,
{
    let mut delays = FibonacciBackoff::from_millis(1000).take(MAX_SEND_ATTEMPTS - 1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(out) => return Ok(out),
            Err(err) if attempt >= MAX_SEND_ATTEMPTS => return Err(err),
            Err(TelegramError::FloodWait(retry_after)) => {
                tracing::warn!(?retry_after, attempt, "flood wait, holding off");
                let _ = delays.next();
                tokio::time::sleep(retry_after + Duration::from_secs(1)).await;
            }
            Err(err) => {
                let Some(delay) = delays.next() else {
                    return Err(err);
                };
                tracing::warn!(error = %err, attempt, "send failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn flood_wait_sleeps_and_retries() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let out = with_flood_retry(|| async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(TelegramError::FloodWait(Duration::from_secs(7))),
                _ => Ok(42),
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // slept retry_after + 1s
        assert!(started.elapsed() >= Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);

        let out: Result<(), _> = with_flood_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TelegramError::Empty)
        })
        .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_SEND_ATTEMPTS);
    }
}
