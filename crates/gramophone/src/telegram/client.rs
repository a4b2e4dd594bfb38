use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, Stream};
use governor::DefaultDirectRateLimiter;
use serde_json::json;
use tokio::io::AsyncReadExt;

use super::{TelegramError, UPLOAD_PART};
use crate::config::ProxyConfig;
use crate::progress::Tracker;
use crate::telegram::types::{ApiResponse, InputMediaAudio, Message, Update, User};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Seconds the server holds a `getUpdates` long poll open.
const POLL_TIMEOUT: u64 = 50;

/// One persistent session against the messaging HTTP API. Sessions live
/// in a pool and count their in-flight requests so uploads can be routed
/// to the least-loaded one.
pub struct Bot {
    http: reqwest::Client,
    base: String,
    in_flight: AtomicUsize,
    limiter: Arc<DefaultDirectRateLimiter>,
}

/// Everything needed to publish one staged audio file.
pub struct SendAudio<'a> {
    pub chat_id: i64,
    pub path: &'a Path,
    pub file_name: &'a str,
    pub mime: &'a str,
    pub title: &'a str,
    pub performer: &'a str,
    pub duration: u32,
    pub caption: Option<&'a str>,
    pub thumbnail: Option<&'a Bytes>,
    pub tracker: &'a Arc<Tracker>,
    pub read_ahead: usize,
    /// Scratch uploads stay silent; the republished group notifies.
    pub silent: bool,
}

impl Bot {
    pub fn new(
        token: &str,
        proxy: Option<&ProxyConfig>,
        limiter: Arc<DefaultDirectRateLimiter>,
    ) -> Result<Self, TelegramError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy.to_proxy()?);
        }
        Ok(Self {
            http: builder.build()?,
            base: format!("https://api.telegram.org/bot{token}"),
            in_flight: AtomicUsize::new(0),
            limiter,
        })
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &json!({})).await
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, html: &str) -> Result<Message, TelegramError> {
        self.call(
            "sendMessage",
            &json!({
                "chat_id": chat_id,
                "text": html,
                "parse_mode": "HTML",
            }),
        )
        .await
    }

    /// Liveness signal; the platform renders it as "sending a file…".
    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<bool, TelegramError> {
        self.call(
            "sendChatAction",
            &json!({
                "chat_id": chat_id,
                "action": action,
            }),
        )
        .await
    }

    /// Republishes previously uploaded files as one album message.
    pub async fn send_media_group(
        &self,
        chat_id: i64,
        media: &[InputMediaAudio<'_>],
    ) -> Result<Vec<Message>, TelegramError> {
        self.call(
            "sendMediaGroup",
            &json!({
                "chat_id": chat_id,
                "media": media,
            }),
        )
        .await
    }

    pub async fn delete_messages(
        &self,
        chat_id: i64,
        message_ids: &[i64],
    ) -> Result<bool, TelegramError> {
        self.call(
            "deleteMessages",
            &json!({
                "chat_id": chat_id,
                "message_ids": message_ids,
            }),
        )
        .await
    }

    /// Streams a staged audio file out in 512 KiB parts, feeding every
    /// part into the batch tracker as it leaves the disk.
    pub async fn send_audio(&self, req: &SendAudio<'_>) -> Result<Message, TelegramError> {
        self.limiter.until_ready().await;

        let size = tokio::fs::metadata(req.path).await?.len();
        let stream = chunk_stream(req.path.to_owned(), Arc::clone(req.tracker), req.read_ahead);
        let audio = reqwest::multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(stream),
            size,
        )
        .file_name(req.file_name.to_owned())
        .mime_str(req.mime)?;

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", req.chat_id.to_string())
            .text("title", req.title.to_owned())
            .text("performer", req.performer.to_owned())
            .text("duration", req.duration.to_string())
            .text("disable_notification", if req.silent { "true" } else { "false" })
            .part("audio", audio);

        if let Some(thumbnail) = req.thumbnail {
            let part = reqwest::multipart::Part::bytes(thumbnail.to_vec())
                .file_name("cover.jpg")
                .mime_str("image/jpeg")?;
            form = form.part("thumbnail", part);
        }
        if let Some(caption) = req.caption {
            form = form
                .text("caption", caption.to_owned())
                .text("parse_mode", "HTML");
        }

        let res = self
            .http
            .post(format!("{}/sendAudio", self.base))
            .multipart(form)
            .send()
            .await?;
        decode(res).await
    }

    pub(crate) fn load(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finish(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    async fn call<T>(&self, method: &str, payload: &serde_json::Value) -> Result<T, TelegramError>
    where
        T: serde::de::DeserializeOwned,
    {
        self.limiter.until_ready().await;
        let res = self
            .http
            .post(format!("{}/{method}", self.base))
            .json(payload)
            .send()
            .await?;
        decode(res).await
    }
}

async fn decode<T>(res: reqwest::Response) -> Result<T, TelegramError>
where
    T: serde::de::DeserializeOwned,
{
    let body: ApiResponse<T> = res.json().await?;
    interpret(body)
}

/// Maps the API envelope onto results: flood waits become their own
/// error so retry middleware can honor `retry_after`.
fn interpret<T>(body: ApiResponse<T>) -> Result<T, TelegramError> {
    if body.ok {
        return body.result.ok_or(TelegramError::Empty);
    }
    if let Some(seconds) = body.parameters.as_ref().and_then(|p| p.retry_after) {
        return Err(TelegramError::FloodWait(Duration::from_secs(seconds)));
    }
    Err(TelegramError::Api {
        code: body.error_code.unwrap_or(0),
        description: body.description.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<serde_json::Value, TelegramError> {
        interpret(serde_json::from_str::<ApiResponse<serde_json::Value>>(json).unwrap())
    }

    #[test]
    fn ok_envelope_yields_the_result() {
        let out = parse(r#"{"ok":true,"result":{"message_id":7}}"#).unwrap();
        assert_eq!(out["message_id"], 7);
    }

    #[test]
    fn flood_wait_carries_retry_after() {
        let out = parse(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 7","parameters":{"retry_after":7}}"#,
        );
        assert!(matches!(
            out,
            Err(TelegramError::FloodWait(d)) if d == Duration::from_secs(7)
        ));
    }

    #[test]
    fn plain_errors_keep_code_and_description() {
        let out = parse(r#"{"ok":false,"error_code":400,"description":"Bad Request"}"#);
        match out {
            Err(TelegramError::Api { code, description }) => {
                assert_eq!(code, 400);
                assert_eq!(description, "Bad Request");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ok_without_result_is_an_error() {
        assert!(matches!(
            parse(r#"{"ok":true}"#),
            Err(TelegramError::Empty)
        ));
    }
}

/// Reads `path` in [`UPLOAD_PART`]-sized chunks through a bounded
/// channel, so up to `read_ahead` parts sit ready while the network
/// drains the previous ones.
fn chunk_stream(
    path: PathBuf,
    tracker: Arc<Tracker>,
    read_ahead: usize,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Bytes, std::io::Error>>(
        read_ahead.max(1),
    );

    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                tx.send(Err(err)).await.ok();
                return;
            }
        };

        let mut buf = vec![0u8; UPLOAD_PART];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    tracker.add(n as u64);
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        // receiver dropped, upload aborted
                        break;
                    }
                }
                Err(err) => {
                    tx.send(Err(err)).await.ok();
                    break;
                }
            }
        }
    });

    rx
}
