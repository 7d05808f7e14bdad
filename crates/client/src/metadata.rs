//! Cloud instance metadata probing.

use crate::transport::Transport;
use registrar_common::{CloudMetadata, MetadataKey};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_METADATA_HOST: &str = "169.254.169.254";
pub const DEFAULT_METADATA_PORT: u16 = 80;
pub const DEFAULT_METADATA_PATH: &str = "/latest/meta-data";

const ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct MetadataProbe<T> {
    transport: T,
    path: String,
    attempts: usize,
    retry_delay: Duration,
}

impl<T: Transport> MetadataProbe<T> {
    pub fn new(transport: T) -> Self {
        Self::with_path(transport, DEFAULT_METADATA_PATH)
    }

    pub fn with_path(transport: T, path: &str) -> Self {
        Self {
            transport,
            path: path.trim_end_matches('/').to_string(),
            attempts: ATTEMPTS,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Probes every known key. A key that never answers is left out; a missing
    /// instance id stops the probe and returns whatever was gathered so far.
    pub async fn load(&self) -> CloudMetadata {
        let mut metadata = CloudMetadata::new();

        for key in MetadataKey::ALL {
            if let Some(value) = self.fetch(key).await {
                metadata.insert(key, value);
            }

            if key == MetadataKey::InstanceId && !metadata.contains(MetadataKey::InstanceId) {
                warn!(host = self.transport.host(), "instance id unavailable, giving up on cloud metadata");
                break;
            }
        }

        info!(keys = metadata.len(), "cloud metadata loaded");
        metadata
    }

    async fn fetch(&self, key: MetadataKey) -> Option<String> {
        let uri = format!("{}/{}", self.path, key.as_str());
        for attempt in 1..=self.attempts {
            match self.transport.get(&uri, StatusCode::OK).await {
                Ok(value) => return Some(value.trim().to_string()),
                Err(e) => {
                    warn!(%key, attempt, error = %e, "cannot get metadata value");
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        None
    }
}
