mod batch;
mod caption;
mod config;
mod download;
mod link;
mod login;
mod progress;
mod router;
mod staging;
mod telegram;
mod upload;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tidal::Tidal;
use tokio_util::sync::CancellationToken;

use crate::download::Downloader;
use crate::login::LoginFlow;
use crate::progress::UploadStatus;
use crate::router::Router;
use crate::staging::Staging;
use crate::telegram::Pool;
use crate::upload::Uploader;
use crate::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or("gramophone=debug,tidal=debug".into()),
        )
        .init();

    let config = config::load()?;

    let staging = Staging::new(config.downloads.dir.clone());
    staging
        .ensure_root()
        .await
        .context("failed to open the downloads root")?;

    let tidal = Tidal::new(tidal::TidalConfig {
        api_url: config.tidal.api_url.clone(),
        auth_url: config.tidal.auth_url.clone(),
        client_id: config.tidal.client_id.clone(),
        quality: config.tidal.quality,
        credentials_path: config.auth.credentials_path.clone(),
    })?;

    let pool = Arc::new(Pool::new(
        &config.telegram.bot_token,
        config.telegram.upload.pool_size,
        config.telegram.proxy.as_ref(),
    )?);

    let me = pool
        .checkout()
        .get_me()
        .await
        .context("the messaging service rejected the account")?;
    tracing::info!(
        bot = %me.username.as_deref().unwrap_or(&me.first_name),
        "bot is ready"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    let status = UploadStatus::default();
    let router = Router {
        worker: Worker::new(shutdown.clone()),
        downloader: Arc::new(Downloader::new(
            tidal.clone(),
            staging.clone(),
            config.downloads.track_concurrency,
            config.downloads.segment_concurrency,
        )),
        uploader: Arc::new(Uploader::new(
            pool.clone(),
            staging,
            config.telegram.upload.peer,
            config.telegram.upload.threads,
            config.telegram.upload.limit,
            Duration::from_secs(config.telegram.upload.pause_secs),
            config.telegram.upload.signature.clone(),
            status.clone(),
        )),
        login: Arc::new(LoginFlow::new(tidal.clone())),
        admin_id: config.auth.admin_id,
        state_path: config.telegram.state_path.clone(),
        status,
        shutdown,
        tidal,
        pool,
    };

    router.run().await
}
