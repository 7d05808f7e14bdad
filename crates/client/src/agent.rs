//! Wires configuration, clients, supervisors and shutdown guards together.

use crate::config::{Config, ConfigError};
use crate::metadata::MetadataProbe;
use crate::registration::{Deregister, Lifecycle, RegistrationClient, RegistrationError};
use crate::shutdown::{ShutdownGuard, ShutdownOutcome};
use crate::supervisor::Supervisor;
use crate::transport::{RestClient, TransportError};
use futures::future::join_all;
use registrar_common::{CloudMetadata, HealthCheck, HealthStatusCode, LifecycleStatus};
use registrar_health::HealthIndicator;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub type Client = RegistrationClient<RestClient>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("cannot bind health endpoint on {addr}: {source}")]
    HealthBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("supervisor for {endpoint} stopped: {source}")]
    Supervisor {
        endpoint: String,
        #[source]
        source: RegistrationError,
    },
    #[error("supervisor task failed: {0}")]
    Task(#[from] JoinError),
}

pub struct Agent {
    config: Config,
}

impl Agent {
    pub fn new(config: Config) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Probes the metadata service when enabled; otherwise the own data center is used.
    pub async fn cloud_metadata(&self) -> Result<CloudMetadata, AgentError> {
        let settings = &self.config.agent.cloud_metadata;
        if !settings.enabled {
            return Ok(CloudMetadata::new());
        }
        let transport = RestClient::new(&settings.host, settings.port, self.config.agent.request_timeout())?;
        Ok(MetadataProbe::with_path(transport, &settings.path).load().await)
    }

    /// One independent client per configured registry.
    pub fn clients(&self, metadata: &CloudMetadata) -> Result<Vec<Arc<Client>>, AgentError> {
        self.config
            .services
            .iter()
            .map(|endpoint| {
                let transport = RestClient::for_endpoint(endpoint, self.config.agent.request_timeout())?;
                Ok(Arc::new(RegistrationClient::new(
                    self.config.registration.clone(),
                    endpoint.clone(),
                    transport,
                    metadata.clone(),
                )))
            })
            .collect()
    }

    /// Runs until `shutdown` resolves or a supervisor hits a fatal error, then
    /// de-registers from every registry.
    pub async fn run<F>(self, shutdown: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        let metadata = self.cloud_metadata().await?;
        let clients = self.clients(&metadata)?;
        let settings = &self.config.agent;
        let app = &self.config.registration.name;

        let cancel = CancellationToken::new();
        let guards: Vec<_> = clients
            .iter()
            .map(|client| ShutdownGuard::new(client.clone()).with_timeout(settings.shutdown_timeout()))
            .collect();

        let health = match &settings.health {
            Some(health) => {
                let listener = TcpListener::bind(health.listen)
                    .await
                    .map_err(|source| AgentError::HealthBind {
                        addr: health.listen,
                        source,
                    })?;
                let indicator = RegistrationHealth::new(
                    clients.iter().map(|client| client.clone() as Arc<dyn Lifecycle>).collect(),
                    cancel.clone(),
                );
                let health_cancel = CancellationToken::new();
                let server = tokio::spawn(registrar_health::serve(
                    listener,
                    Arc::new(indicator),
                    health_cancel.clone(),
                ));
                Some((server, health_cancel))
            }
            None => None,
        };

        let mut supervisors = JoinSet::new();
        for client in &clients {
            let endpoint = client.endpoint().to_string();
            info!(%app, %endpoint, "starting lifecycle service");
            let supervisor = Supervisor::new(client.clone(), cancel.child_token())
                .with_keep_alive_interval(settings.keep_alive_interval());
            supervisors.spawn(async move {
                supervisor
                    .run()
                    .await
                    .map_err(|source| AgentError::Supervisor { endpoint, source })
            });
        }

        let mut failure = None;
        tokio::pin!(shutdown);
        tokio::select! {
            _ = &mut shutdown => info!(%app, "shutdown requested"),
            Some(joined) = supervisors.join_next() => {
                failure = flatten(joined).err();
            }
        }

        cancel.cancel();
        let drain = async {
            let mut first = failure;
            while let Some(joined) = supervisors.join_next().await {
                if let Err(e) = flatten(joined) {
                    error!(error = %e, "supervisor ended with an error");
                    first.get_or_insert(e);
                }
            }
            first
        };
        let (outcomes, failure) = tokio::join!(join_all(guards.iter().map(|guard| guard.execute())), drain);

        let confirmed = outcomes
            .iter()
            .filter(|outcome| **outcome == ShutdownOutcome::Confirmed)
            .count();
        info!(%app, confirmed, attempted = outcomes.len(), "de-registration on shutdown finished");

        if let Some((server, health_cancel)) = health {
            health_cancel.cancel();
            match server.await {
                Ok(Err(e)) => warn!(error = %e, "health endpoint failed"),
                Err(e) => warn!(error = %e, "health endpoint task failed"),
                Ok(Ok(())) => {}
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn flatten(joined: Result<Result<(), AgentError>, JoinError>) -> Result<(), AgentError> {
    joined?
}

/// Health derived from the registration state of every endpoint.
pub struct RegistrationHealth {
    clients: Vec<Arc<dyn Lifecycle>>,
    stopping: CancellationToken,
}

impl RegistrationHealth {
    pub fn new(clients: Vec<Arc<dyn Lifecycle>>, stopping: CancellationToken) -> Self {
        Self { clients, stopping }
    }
}

impl HealthIndicator for RegistrationHealth {
    fn health(&self) -> HealthCheck {
        if self.stopping.is_cancelled() {
            return HealthCheck::new(HealthStatusCode::OutOfService, "shutting down");
        }
        let registered = self
            .clients
            .iter()
            .filter(|client| matches!(client.status(), LifecycleStatus::Registered | LifecycleStatus::KeepAlive))
            .count();
        if registered > 0 {
            HealthCheck::new(
                HealthStatusCode::Up,
                format!("registered with {} of {} registries", registered, self.clients.len()),
            )
        } else {
            HealthCheck::new(HealthStatusCode::Down, "not registered with any registry")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::tests::{client, StubTransport};
    use httpmock::Method::{DELETE, POST, PUT};
    use httpmock::MockServer;
    use std::time::Duration;

    fn config_for(server: &MockServer, keep_alive_secs: u64) -> Config {
        let raw = format!(
            r#"
services:
  - host: {host}
    port: {port}
    contextPath: /eureka
registration:
  name: neo4j
  hostname: neo4j.example.com
  ipAddress: 127.0.0.1
  port: {{ port: 7474, enabled: true }}
agent:
  keepAliveIntervalSecs: {keep_alive_secs}
"#,
            host = server.host(),
            port = server.port(),
        );
        Config::from_yaml(&raw).unwrap()
    }

    #[tokio::test]
    async fn runs_full_lifecycle_against_registry() {
        let server = MockServer::start_async().await;
        let register = server
            .mock_async(|when, then| {
                when.method(POST).path("/eureka/apps/neo4j").body_contains(r#""instanceId":"neo4j:neo4j:7474""#);
                then.status(204);
            })
            .await;
        let renew = server
            .mock_async(|when, then| {
                when.method(PUT).path("/eureka/apps/neo4j/neo4j:neo4j:7474");
                then.status(200);
            })
            .await;
        let remove = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/eureka/apps/neo4j/neo4j:neo4j:7474");
                then.status(200);
            })
            .await;

        let agent = Agent::new(config_for(&server, 1)).unwrap();
        agent
            .run(tokio::time::sleep(Duration::from_millis(2500)))
            .await
            .unwrap();

        register.assert_hits_async(1).await;
        assert!(renew.hits_async().await >= 1);
        // Supervisor cleanup and shutdown guard both attempt removal.
        assert_eq!(remove.hits_async().await, 2);
    }

    #[tokio::test]
    async fn metadata_is_empty_when_probe_disabled() {
        let server = MockServer::start_async().await;
        let agent = Agent::new(config_for(&server, 30)).unwrap();
        assert!(agent.cloud_metadata().await.unwrap().is_empty());
        assert_eq!(agent.clients(&CloudMetadata::new()).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn health_follows_registration_state() {
        let transport = Arc::new(StubTransport::default());
        let registered = Arc::new(client(transport.clone()));
        let idle = Arc::new(client(transport));
        let stopping = CancellationToken::new();
        let health = RegistrationHealth::new(
            vec![registered.clone() as Arc<dyn Lifecycle>, idle as Arc<dyn Lifecycle>],
            stopping.clone(),
        );

        assert_eq!(health.health().code, HealthStatusCode::Down);

        registered.register().await.unwrap();
        let check = health.health();
        assert_eq!(check.code, HealthStatusCode::Up);
        assert_eq!(check.description, "registered with 1 of 2 registries");

        stopping.cancel();
        assert_eq!(health.health().code, HealthStatusCode::OutOfService);
    }
}
