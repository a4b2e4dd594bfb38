use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::Tidal;
use crate::error::TidalError;

const SCOPE: &str = "r_usr w_usr";

/// Seconds a token must still be valid for before it is handed out.
const SAFETY_MARGIN: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub country_code: String,
}

impl Credentials {
    pub fn fresh(&self, now: i64) -> bool {
        now + SAFETY_MARGIN < self.expires_at
    }
}

/// On-disk access/refresh token tuple, file mode 0600. All consumers go
/// through [`CredentialStore::credentials`], which refreshes a stale
/// token exactly once no matter how many callers race on it.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<Option<Credentials>>,
    rotated: AtomicBool,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(None),
            rotated: AtomicBool::new(false),
        }
    }

    /// Current credentials, or [`TidalError::LoginRequired`] when the
    /// operator has never authorized.
    pub async fn load(&self) -> Result<Credentials, TidalError> {
        let mut state = self.state.lock().await;
        if let Some(creds) = state.as_ref() {
            return Ok(creds.clone());
        }
        let creds = self.read_file().await?;
        *state = Some(creds.clone());
        Ok(creds)
    }

    pub async fn authorized(&self) -> bool {
        self.load().await.is_ok()
    }

    /// Persist freshly obtained credentials (login flow completion).
    pub async fn save(&self, creds: Credentials) -> Result<(), TidalError> {
        let mut state = self.state.lock().await;
        self.persist(&creds).await?;
        *state = Some(creds);
        Ok(())
    }

    /// Credentials valid for at least [`SAFETY_MARGIN`] more seconds.
    ///
    /// A stale token is refreshed through `refresh` while the store lock
    /// is held, so concurrent callers observing the same stale token
    /// block on one refresh attempt and then all take the fast path.
    pub async fn credentials<F, Fut>(&self, refresh: F) -> Result<Credentials, TidalError>
    where
        F: FnOnce(Credentials) -> Fut,
        Fut: Future<Output = Result<Credentials, TidalError>>,
    {
        let mut state = self.state.lock().await;
        let current = match state.take() {
            Some(creds) => creds,
            None => self.read_file().await?,
        };

        if current.fresh(Utc::now().timestamp()) {
            *state = Some(current.clone());
            return Ok(current);
        }

        tracing::debug!("access token stale, refreshing");
        let fresh = match refresh(current.clone()).await {
            Ok(fresh) => fresh,
            Err(err) => {
                *state = Some(current);
                return Err(err);
            }
        };

        if fresh.refresh_token != current.refresh_token {
            self.rotated.store(true, Ordering::SeqCst);
            tracing::info!("provider rotated the refresh token");
        }

        let persisted = self.persist(&fresh).await;
        *state = Some(fresh.clone());
        persisted?;
        Ok(fresh)
    }

    /// Drops the in-memory token's remaining lifetime so the next
    /// [`credentials`](Self::credentials) call refreshes. Used after the
    /// provider answers 401 to a supposedly valid token.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if let Some(creds) = state.as_mut() {
            creds.expires_at = 0;
        }
    }

    /// One-shot advisory: true once after a refresh rotated the refresh
    /// token, then false until it happens again.
    pub fn take_refresh_advisory(&self) -> bool {
        self.rotated.swap(false, Ordering::SeqCst)
    }

    async fn read_file(&self) -> Result<Credentials, TidalError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TidalError::LoginRequired);
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomic replace: write a temp sibling, fsync, rename over the
    /// target. A failed write never clobbers the previous file.
    async fn persist(&self, creds: &Credentials) -> Result<(), TidalError> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(creds)?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await?;
        let written = async {
            file.write_all(&bytes).await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(err.into());
        }

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: u64,
}

#[derive(Debug)]
pub enum DevicePoll {
    Pending,
    SlowDown,
    Complete(Credentials),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    user: Option<TokenUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenUser {
    country_code: String,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
}

impl TokenResponse {
    fn into_credentials(self, fallback_refresh: &str, fallback_country: &str) -> Credentials {
        Credentials {
            token: self.access_token,
            refresh_token: self
                .refresh_token
                .unwrap_or_else(|| fallback_refresh.to_owned()),
            expires_at: Utc::now().timestamp() + self.expires_in,
            country_code: self
                .user
                .map(|user| user.country_code)
                .unwrap_or_else(|| fallback_country.to_owned()),
        }
    }
}

impl Tidal {
    /// Starts a device-code authorization and returns the link the
    /// operator has to visit.
    pub async fn device_authorization(&self) -> Result<DeviceAuthorization, TidalError> {
        self.throttle().await;
        let url = format!("{}/device_authorization", self.auth_url());
        let res = self
            .http()
            .post(&url)
            .form(&[("client_id", self.client_id()), ("scope", SCOPE)])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(api_error("device_authorization", res).await);
        }
        Ok(res.json().await?)
    }

    /// One poll step of the device-code grant.
    pub async fn poll_device(&self, device_code: &str) -> Result<DevicePoll, TidalError> {
        self.throttle().await;
        let url = format!("{}/token", self.auth_url());
        let res = self
            .http()
            .post(&url)
            .form(&[
                ("client_id", self.client_id()),
                ("device_code", device_code),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("scope", SCOPE),
            ])
            .send()
            .await?;

        let status = res.status();
        if status.is_success() {
            let token: TokenResponse = res.json().await?;
            return Ok(DevicePoll::Complete(token.into_credentials("", "")));
        }

        let body = res.text().await.unwrap_or_default();
        if let Ok(err) = serde_json::from_str::<TokenErrorBody>(&body) {
            match err.error.as_str() {
                "authorization_pending" => return Ok(DevicePoll::Pending),
                "slow_down" => return Ok(DevicePoll::SlowDown),
                "expired_token" | "invalid_grant" => return Err(TidalError::LoginLinkExpired),
                _ => {}
            }
        }
        Err(TidalError::Api {
            endpoint: "token".into(),
            status: status.as_u16(),
            body,
        })
    }

    /// Exchanges a refresh token for a new access token. A refusal means
    /// the stored grant is gone for good and the operator has to log in
    /// again.
    pub(crate) async fn refresh(&self, current: Credentials) -> Result<Credentials, TidalError> {
        self.throttle().await;
        let url = format!("{}/token", self.auth_url());
        let res = self
            .http()
            .post(&url)
            .form(&[
                ("client_id", self.client_id()),
                ("refresh_token", current.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
                ("scope", SCOPE),
            ])
            .send()
            .await?;

        let status = res.status();
        if status.is_success() {
            let token: TokenResponse = res.json().await?;
            return Ok(token.into_credentials(&current.refresh_token, &current.country_code));
        }
        if status.as_u16() == 400 || status.as_u16() == 401 {
            tracing::warn!(status = status.as_u16(), "provider refused token refresh");
            return Err(TidalError::LoginRequired);
        }
        Err(api_error("token", res).await)
    }
}

pub(crate) async fn api_error(endpoint: &str, res: reqwest::Response) -> TidalError {
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    TidalError::Api {
        endpoint: endpoint.to_owned(),
        status,
        body,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn creds(token: &str, expires_at: i64) -> Credentials {
        Credentials {
            token: token.to_owned(),
            refresh_token: "refresh".to_owned(),
            expires_at,
            country_code: "NL".to_owned(),
        }
    }

    #[tokio::test]
    async fn load_without_file_is_login_required() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        assert!(matches!(
            store.load().await,
            Err(TidalError::LoginRequired)
        ));
        assert!(!store.authorized().await);
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = CredentialStore::new(path.clone());
        let expected = creds("tok", Utc::now().timestamp() + 3600);
        store.save(expected.clone()).await.unwrap();

        // a second store re-reads from disk
        let reloaded = CredentialStore::new(path).load().await.unwrap();
        assert_eq!(reloaded, expected);
    }

    #[tokio::test]
    async fn fresh_token_skips_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        store
            .save(creds("tok", Utc::now().timestamp() + 3600))
            .await
            .unwrap();

        let out = store
            .credentials(|_| async {
                Err(TidalError::Coalesced("refresh must not run".to_owned()))
            })
            .await
            .unwrap();
        assert_eq!(out.token, "tok");
    }

    #[tokio::test]
    async fn concurrent_stale_callers_refresh_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path().join("credentials.json")));
        store.save(creds("stale", 0)).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                store
                    .credentials(move |old| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Credentials {
                            token: "new".to_owned(),
                            expires_at: Utc::now().timestamp() + 3600,
                            ..old
                        })
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().token, "new");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotation_sets_one_shot_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        store.save(creds("stale", 0)).await.unwrap();

        store
            .credentials(|old| async move {
                Ok(Credentials {
                    token: "new".to_owned(),
                    refresh_token: "rotated".to_owned(),
                    expires_at: Utc::now().timestamp() + 3600,
                    ..old
                })
            })
            .await
            .unwrap();

        assert!(store.take_refresh_advisory());
        assert!(!store.take_refresh_advisory());
    }

    #[tokio::test]
    async fn failed_save_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = CredentialStore::new(path.clone());
        let original = creds("tok", 42);
        store.save(original.clone()).await.unwrap();

        // a directory squatting on the temp path makes the write fail
        let tmp = path.with_extension("json.tmp");
        tokio::fs::create_dir(&tmp).await.unwrap();
        assert!(store.save(creds("other", 43)).await.is_err());
        tokio::fs::remove_dir(&tmp).await.unwrap();

        let reloaded = CredentialStore::new(path).load().await.unwrap();
        assert_eq!(reloaded, original);
    }
}
