use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;

use crate::telegram::Peer;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub tidal: TidalConfig,
    pub downloads: DownloadsConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Where the last consumed update id is persisted across restarts.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    pub upload: UploadConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Deserialize)]
pub struct UploadConfig {
    /// Destination for mirrored audio.
    pub peer: Peer,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Read-ahead depth, in 512 KiB parts, while a file streams out.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Files uploaded in parallel within one batch.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Delay between consecutive media groups.
    #[serde(default = "default_pause_secs")]
    pub pause_secs: u64,
    /// Raw HTML appended to the last caption of every batch.
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// SOCKS5 proxy for the messaging sessions.
    pub fn to_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        let url = format!("socks5://{}:{}", self.host, self.port);
        let mut proxy = reqwest::Proxy::all(&url)?;
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            proxy = proxy.basic_auth(username, password);
        }
        Ok(proxy)
    }
}

#[derive(Debug, Deserialize)]
pub struct TidalConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    pub client_id: String,
    #[serde(default = "default_quality")]
    pub quality: tidal::AudioQuality,
}

#[derive(Debug, Deserialize)]
pub struct DownloadsConfig {
    pub dir: PathBuf,
    #[serde(default = "default_track_concurrency")]
    pub track_concurrency: usize,
    #[serde(default = "default_segment_concurrency")]
    pub segment_concurrency: usize,
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// The single operator allowed to drive the bot.
    pub admin_id: i64,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("gramophone.state.json")
}

fn default_pool_size() -> usize {
    8
}

fn default_threads() -> usize {
    4
}

fn default_limit() -> usize {
    4
}

fn default_pause_secs() -> u64 {
    10
}

fn default_api_url() -> String {
    "https://api.tidal.com/v1".to_owned()
}

fn default_auth_url() -> String {
    "https://auth.tidal.com/v1/oauth2".to_owned()
}

fn default_quality() -> tidal::AudioQuality {
    tidal::AudioQuality::Lossless
}

fn default_track_concurrency() -> usize {
    4
}

fn default_segment_concurrency() -> usize {
    4
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

pub fn load() -> anyhow::Result<Config> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("failed to get config directory"))?
        .join("gramophone")
        .join("config.yaml");

    Ok(Figment::new()
        .merge(Yaml::file("config.yaml"))
        .merge(Yaml::file(config_dir))
        .merge(Env::prefixed("GRAMOPHONE_").split("__"))
        .extract()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::PeerKind;

    const MINIMAL: &str = r#"
telegram:
  bot_token: "123:abc"
  upload:
    peer:
      kind: channel
      id: 1234567890
tidal:
  client_id: "client"
downloads:
  dir: "/downloads"
auth:
  admin_id: 111222333
"#;

    #[test]
    fn minimal_yaml_fills_defaults() {
        let config: Config = Figment::new()
            .merge(Yaml::string(MINIMAL))
            .extract()
            .unwrap();

        assert_eq!(config.telegram.upload.pool_size, 8);
        assert_eq!(config.telegram.upload.threads, 4);
        assert_eq!(config.telegram.upload.limit, 4);
        assert_eq!(config.telegram.upload.pause_secs, 10);
        assert!(config.telegram.upload.signature.is_none());
        assert!(config.telegram.proxy.is_none());
        assert!(matches!(config.telegram.upload.peer.kind, PeerKind::Channel));
        assert_eq!(config.tidal.api_url, "https://api.tidal.com/v1");
        assert_eq!(config.tidal.auth_url, "https://auth.tidal.com/v1/oauth2");
        assert_eq!(config.tidal.quality, tidal::AudioQuality::Lossless);
        assert_eq!(config.downloads.track_concurrency, 4);
        assert_eq!(config.downloads.segment_concurrency, 4);
        assert_eq!(config.auth.admin_id, 111222333);
    }

    #[test]
    fn explicit_values_win() {
        let yaml = r#"
telegram:
  bot_token: "123:abc"
  state_path: "/var/lib/gramophone/state.json"
  upload:
    peer:
      kind: user
      id: 42
    pool_size: 2
    threads: 8
    pause_secs: 3
    signature: "<b>sig</b>"
  proxy:
    host: "127.0.0.1"
    port: 1080
tidal:
  client_id: "client"
  quality: HI_RES
downloads:
  dir: "/downloads"
  track_concurrency: 2
  segment_concurrency: 6
auth:
  admin_id: 1
  credentials_path: "/secrets/tidal.json"
"#;
        let config: Config = Figment::new().merge(Yaml::string(yaml)).extract().unwrap();

        assert_eq!(config.telegram.upload.pool_size, 2);
        assert_eq!(config.telegram.upload.threads, 8);
        assert_eq!(config.telegram.upload.pause_secs, 3);
        assert_eq!(config.telegram.upload.signature.as_deref(), Some("<b>sig</b>"));
        assert_eq!(config.telegram.proxy.as_ref().unwrap().port, 1080);
        assert_eq!(config.tidal.quality, tidal::AudioQuality::HiRes);
        assert_eq!(config.downloads.segment_concurrency, 6);
        assert_eq!(
            config.auth.credentials_path,
            PathBuf::from("/secrets/tidal.json")
        );
    }
}
