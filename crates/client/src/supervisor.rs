//! Keeps one registry endpoint's registration alive until cancelled.

use crate::registration::{Lifecycle, RegistrationError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);

pub struct Supervisor<C: ?Sized> {
    client: Arc<C>,
    cancel: CancellationToken,
    keep_alive_interval: Duration,
    backoff: Duration,
}

impl<C: Lifecycle + ?Sized + 'static> Supervisor<C> {
    pub fn new(client: Arc<C>, cancel: CancellationToken) -> Self {
        Self {
            client,
            cancel,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            backoff: RESTART_BACKOFF,
        }
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn spawn(self) -> JoinHandle<Result<(), RegistrationError>> {
        tokio::spawn(self.run())
    }

    /// Runs register → keep-alive cycles until cancelled. Every cycle ends with one
    /// de-registration attempt. Only fatal errors end the loop early.
    pub async fn run(self) -> Result<(), RegistrationError> {
        let endpoint = self.client.endpoint().to_string();
        info!(%endpoint, "starting lifecycle supervisor");

        while !self.cancel.is_cancelled() {
            let outcome = self.cycle().await;

            if let Err(e) = self.client.deregister().await {
                // A later registration supersedes whatever is left on the registry.
                error!(%endpoint, error = %e, "de-registration after cycle failed");
            }

            match outcome {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(%endpoint, error = %e, "fatal registration error, stopping supervisor");
                    return Err(e);
                }
                Err(e) => {
                    error!(%endpoint, error = %e, backoff = ?self.backoff, "registration cycle failed, restarting");
                    self.pause(self.backoff).await;
                }
            }
        }

        info!(%endpoint, "lifecycle supervisor stopped");
        Ok(())
    }

    async fn cycle(&self) -> Result<(), RegistrationError> {
        self.client.register().await?;

        while self.pause(self.keep_alive_interval).await {
            self.client.keep_alive().await?;
        }
        debug!(endpoint = self.client.endpoint(), "cycle interrupted");
        Ok(())
    }

    /// Returns false when woken by cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = time::sleep(duration) => !self.cancel.is_cancelled(),
        }
    }
}
