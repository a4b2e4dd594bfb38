use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TidalError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("non-ok response from {endpoint}: {status}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("authorization required")]
    LoginRequired,

    #[error("device login link expired")]
    LoginLinkExpired,

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to parse manifest xml: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("malformed manifest: {0}")]
    Manifest(&'static str),

    #[error("unsupported manifest mime type: {0}")]
    UnsupportedManifest(String),

    #[error("unsupported format: {mime_type}/{codec}")]
    UnsupportedFormat { mime_type: String, codec: String },

    #[error("decrypt error: {0}")]
    Decrypt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Coalesced(String),
}

impl TidalError {
    /// Flattens an error shared by coalesced cache loaders. Sentinel
    /// variants the caller matches on are reconstructed, the rest keep
    /// only their message.
    pub(crate) fn shared(err: Arc<TidalError>) -> TidalError {
        match Arc::try_unwrap(err) {
            Ok(err) => err,
            Err(err) => match &*err {
                TidalError::LoginRequired => TidalError::LoginRequired,
                TidalError::LoginLinkExpired => TidalError::LoginLinkExpired,
                other => TidalError::Coalesced(other.to_string()),
            },
        }
    }
}
