//! Best-effort de-registration when the process stops.

use crate::registration::{Deregister, RegistrationError};
use crate::transport::Transport;
use async_trait::async_trait;
use registrar_common::{RegistrationSpec, RegistryEndpoint};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The registry acknowledged the removal.
    Confirmed,
    /// Removal was attempted but not confirmed.
    Attempted,
}

/// Removes the instance from one registry endpoint. Never fails.
pub struct ShutdownGuard<D: ?Sized> {
    target: Arc<D>,
    timeout: Duration,
}

impl<D: Deregister + ?Sized> ShutdownGuard<D> {
    pub fn new(target: Arc<D>) -> Self {
        Self {
            target,
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn execute(&self) -> ShutdownOutcome {
        let endpoint = self.target.endpoint();
        info!(endpoint, "de-registering on shutdown");

        match tokio::time::timeout(self.timeout, self.target.deregister()).await {
            Ok(Ok(())) => ShutdownOutcome::Confirmed,
            Ok(Err(e)) => {
                // Already shutting down, nothing else to do.
                warn!(endpoint, error = %e, "de-registration on shutdown failed");
                ShutdownOutcome::Attempted
            }
            Err(_) => {
                warn!(endpoint, timeout = ?self.timeout, "de-registration on shutdown timed out");
                ShutdownOutcome::Attempted
            }
        }
    }
}

/// Transport-only removal for instances this process never registered itself.
/// The instance id defaults to the configured hostname.
pub struct DirectDeregistration<T> {
    transport: T,
    uri: String,
}

impl<T: Transport> DirectDeregistration<T> {
    pub fn new(transport: T, endpoint: &RegistryEndpoint, spec: &RegistrationSpec) -> Self {
        Self::with_instance_id(transport, endpoint, spec, &spec.hostname)
    }

    pub fn with_instance_id(
        transport: T,
        endpoint: &RegistryEndpoint,
        spec: &RegistrationSpec,
        instance_id: &str,
    ) -> Self {
        Self {
            transport,
            uri: endpoint.instance_uri(&spec.name, instance_id),
        }
    }
}

#[async_trait]
impl<T: Transport> Deregister for DirectDeregistration<T> {
    fn endpoint(&self) -> &str {
        self.transport.host()
    }

    async fn deregister(&self) -> Result<(), RegistrationError> {
        self.transport.delete(&self.uri, StatusCode::OK).await?;
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
