use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tidal::{DeviceAuthorization, DevicePoll, Tidal, TidalError};
use tokio::sync::{Semaphore, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::worker::Interrupted;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("another authorization is already in progress")]
    InProgress,

    #[error(transparent)]
    Tidal(#[from] TidalError),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Device-code authorization flow. At most one flow is pending at a
/// time; a second initiate is refused until the poller finishes.
pub struct LoginFlow {
    tidal: Tidal,
    permit: Arc<Semaphore>,
}

impl LoginFlow {
    pub fn new(tidal: Tidal) -> Self {
        Self {
            tidal,
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    /// Starts a flow: returns the link the operator has to visit plus a
    /// single-shot waiter that resolves when the poller ends: with
    /// success, [`TidalError::LoginLinkExpired`], or the shutdown cause.
    pub async fn initiate(
        &self,
        shutdown: CancellationToken,
    ) -> Result<(String, oneshot::Receiver<Result<(), LoginError>>), LoginError> {
        let Ok(permit) = self.permit.clone().try_acquire_owned() else {
            return Err(LoginError::InProgress);
        };

        // a failure here drops the permit and frees the flow again
        let device = self.tidal.device_authorization().await?;
        let link = verification_link(&device);
        tracing::info!(expires_in = device.expires_in, "device authorization started");

        let (tx, rx) = oneshot::channel();
        let tidal = self.tidal.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = poll_until_done(&tidal, &device, &shutdown).await;
            if let Err(err) = &outcome {
                tracing::warn!(error = %err, "device authorization did not complete");
            }
            tx.send(outcome).ok();
        });

        Ok((link, rx))
    }
}

fn verification_link(device: &DeviceAuthorization) -> String {
    let link = &device.verification_uri_complete;
    if link.starts_with("https://") || link.starts_with("http://") {
        link.clone()
    } else {
        format!("https://{link}")
    }
}

/// Polls the token endpoint at the provider's recommended interval
/// until the grant completes, the link expires, or shutdown cancels the
/// flow. A `slow_down` answer stretches the interval.
async fn poll_until_done(
    tidal: &Tidal,
    device: &DeviceAuthorization,
    shutdown: &CancellationToken,
) -> Result<(), LoginError> {
    let deadline = Instant::now() + Duration::from_secs(device.expires_in.max(0) as u64);
    let mut interval = Duration::from_secs(device.interval.max(1));

    loop {
        if Instant::now() >= deadline {
            return Err(TidalError::LoginLinkExpired.into());
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Err(Interrupted::Shutdown.into()),
            _ = tokio::time::sleep(interval) => {}
        }

        match tidal.poll_device(&device.device_code).await {
            Ok(DevicePoll::Pending) => {}
            Ok(DevicePoll::SlowDown) => {
                interval += Duration::from_secs(1);
                tracing::debug!(?interval, "provider asked to slow down");
            }
            Ok(DevicePoll::Complete(creds)) => {
                tidal.store().save(creds).await?;
                tracing::info!("authorization complete");
                return Ok(());
            }
            Err(err @ TidalError::LoginLinkExpired) => return Err(err.into()),
            Err(err) => {
                // transient; the next tick tries again
                tracing::warn!(error = %err, "device poll failed");
            }
        }
    }
}
