mod album;
mod artist;
mod auth;
mod crypt;
mod error;
mod id;
mod manifest;
mod mix;
mod playlist;
mod track;

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use moka::future::Cache;
use serde::{Deserialize, Serialize};

pub use album::{Album, AlbumDetails};
pub use artist::{Artist, ArtistRole};
pub use auth::{CredentialStore, Credentials, DeviceAuthorization, DevicePoll};
pub use crypt::decrypt_track;
pub use error::TidalError;
pub use id::{AlbumId, ArtistId, MixId, PlaylistId, TrackId};
pub use manifest::{Manifest, extension_for};
pub use playlist::Playlist;
pub use track::{AlbumSummary, Track};

const IMAGE_URL: &str = "https://resources.tidal.com/images";
const COVER_SIZE: &str = "1280x1280";
const PAGE_LIMIT: u32 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
const CACHE_TTL: Duration = Duration::from_secs(3600);
const REQUESTS_PER_SECOND: NonZeroU32 = NonZeroU32::new(5).unwrap();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioQuality {
    Lossless,
    HiRes,
}

impl AudioQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioQuality::Lossless => "LOSSLESS",
            AudioQuality::HiRes => "HI_RES",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TidalConfig {
    pub api_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub quality: AudioQuality,
    pub credentials_path: PathBuf,
}

/// Authenticated, rate-limited client for the provider's public API.
/// Cheap to clone; all clones share the credential store, the request
/// throttle, and the metadata caches.
#[derive(Clone)]
pub struct Tidal {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    api_url: String,
    auth_url: String,
    client_id: String,
    quality: AudioQuality,
    store: CredentialStore,
    limiter: DefaultDirectRateLimiter,
    albums: Cache<AlbumId, Arc<AlbumDetails>>,
    tracks: Cache<TrackId, Arc<Track>>,
    covers: Cache<String, Bytes>,
}

impl Tidal {
    pub fn new(config: TidalConfig) -> Result<Self, TidalError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                api_url: config.api_url.trim_end_matches('/').to_owned(),
                auth_url: config.auth_url.trim_end_matches('/').to_owned(),
                client_id: config.client_id,
                quality: config.quality,
                store: CredentialStore::new(config.credentials_path),
                limiter: RateLimiter::direct(Quota::per_second(REQUESTS_PER_SECOND)),
                albums: Cache::builder()
                    .max_capacity(256)
                    .time_to_live(CACHE_TTL)
                    .build(),
                tracks: Cache::builder()
                    .max_capacity(4096)
                    .time_to_live(CACHE_TTL)
                    .build(),
                covers: Cache::builder()
                    .max_capacity(64)
                    .time_to_live(CACHE_TTL)
                    .build(),
            }),
        })
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn quality(&self) -> AudioQuality {
        self.inner.quality
    }

    /// Cover artwork bytes, cached for an hour. Concurrent misses for
    /// the same cover share one fetch.
    pub async fn cover(&self, cover_id: &str) -> Result<Bytes, TidalError> {
        let this = self.clone();
        let id = cover_id.to_owned();
        self.inner
            .covers
            .try_get_with(cover_id.to_owned(), async move {
                this.throttle().await;
                let url = format!("{IMAGE_URL}/{}/{COVER_SIZE}.jpg", id.replace('-', "/"));
                let res = this.inner.http.get(&url).send().await?;
                if !res.status().is_success() {
                    return Err(auth::api_error("cover", res).await);
                }
                Ok(res.bytes().await?)
            })
            .await
            .map_err(TidalError::shared)
    }

    /// One stream segment. The URL comes from a parsed manifest and is
    /// already signed, so no auth header is attached.
    pub async fn segment(&self, url: &str) -> Result<Bytes, TidalError> {
        self.throttle().await;
        let res = self.inner.http.get(url).send().await?;
        if !res.status().is_success() {
            return Err(auth::api_error("segment", res).await);
        }
        Ok(res.bytes().await?)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub(crate) fn auth_url(&self) -> &str {
        &self.inner.auth_url
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub(crate) fn albums_cache(&self) -> &Cache<AlbumId, Arc<AlbumDetails>> {
        &self.inner.albums
    }

    pub(crate) fn tracks_cache(&self) -> &Cache<TrackId, Arc<Track>> {
        &self.inner.tracks
    }

    pub(crate) async fn throttle(&self) {
        self.inner.limiter.until_ready().await;
    }

    /// Authenticated GET against the REST API. A 401 forces one token
    /// refresh and one retry before the error is surfaced.
    pub(crate) async fn get<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, TidalError>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut forced = false;
        loop {
            self.throttle().await;
            let creds = self
                .inner
                .store
                .credentials(|current| self.refresh(current))
                .await?;

            let url = format!("{}/{path}", self.inner.api_url);
            let res = self
                .inner
                .http
                .get(&url)
                .bearer_auth(&creds.token)
                .query(&[("countryCode", creds.country_code.as_str())])
                .query(query)
                .send()
                .await?;

            let status = res.status();
            if status.is_success() {
                return Ok(res.json().await?);
            }
            if status == reqwest::StatusCode::UNAUTHORIZED && !forced {
                tracing::debug!(path, "unauthorized response, forcing a token refresh");
                self.inner.store.invalidate().await;
                forced = true;
                continue;
            }
            return Err(auth::api_error(path, res).await);
        }
    }

    /// Drains a paginated `…/items` listing in provider order.
    pub(crate) async fn paged<T>(&self, path: &str) -> Result<Vec<T>, TidalError>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut offset = 0u32;
        loop {
            let page: Page<T> = self
                .get(
                    path,
                    &[
                        ("limit", PAGE_LIMIT.to_string()),
                        ("offset", offset.to_string()),
                    ],
                )
                .await?;
            let fetched = page.items.len() as u32;
            items.extend(page.items);
            offset += fetched;
            if fetched == 0 || offset >= page.total_number_of_items {
                return Ok(items);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    total_number_of_items: u32,
    items: Vec<T>,
}
