//! Register / renew / remove one application instance on one registry node.

use crate::identity::{HostnameLookup, IdentityResolver, SystemLookup};
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use registrar_common::{
    CloudMetadata, InstanceDescriptor, InstanceEnvelope, InstanceStatus, LifecycleStatus, RegistrationSpec,
    RegistryEndpoint,
};
use reqwest::StatusCode;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Wait before the DELETE so an in-flight renewal cannot resurrect the entry.
pub const DEREGISTER_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to serialize instance descriptor: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("no registered instance for {app}")]
    NoLiveInstance { app: String },
}

impl RegistrationError {
    /// Fatal errors stop the agent instead of restarting the cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistrationError::Serialization(_))
    }
}

#[async_trait]
pub trait Deregister: Send + Sync {
    /// Registry host, used for log context.
    fn endpoint(&self) -> &str;

    async fn deregister(&self) -> Result<(), RegistrationError>;
}

#[async_trait]
pub trait Lifecycle: Deregister {
    fn status(&self) -> LifecycleStatus;

    async fn register(&self) -> Result<(), RegistrationError>;

    async fn keep_alive(&self) -> Result<(), RegistrationError>;
}

#[derive(Debug)]
struct State {
    instance: Option<InstanceDescriptor>,
    status: LifecycleStatus,
}

pub struct RegistrationClient<T, L = SystemLookup> {
    spec: RegistrationSpec,
    endpoint: RegistryEndpoint,
    transport: T,
    metadata: CloudMetadata,
    resolver: IdentityResolver<L>,
    grace: Duration,
    state: Mutex<State>,
}

impl<T: Transport> RegistrationClient<T, SystemLookup> {
    pub fn new(spec: RegistrationSpec, endpoint: RegistryEndpoint, transport: T, metadata: CloudMetadata) -> Self {
        Self::with_resolver(spec, endpoint, transport, metadata, IdentityResolver::new())
    }
}

impl<T: Transport, L: HostnameLookup> RegistrationClient<T, L> {
    pub fn with_resolver(
        spec: RegistrationSpec,
        endpoint: RegistryEndpoint,
        transport: T,
        metadata: CloudMetadata,
        resolver: IdentityResolver<L>,
    ) -> Self {
        Self {
            spec,
            endpoint,
            transport,
            metadata,
            resolver,
            grace: DEREGISTER_GRACE,
            state: Mutex::new(State {
                instance: None,
                status: LifecycleStatus::Unknown,
            }),
        }
    }

    pub fn with_deregister_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// The descriptor currently owned by this client, if any.
    pub fn instance(&self) -> Option<InstanceDescriptor> {
        self.lock().instance.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_instance_id(&self) -> Result<String, RegistrationError> {
        self.lock()
            .instance
            .as_ref()
            .map(|instance| instance.instance_id.clone())
            .ok_or_else(|| RegistrationError::NoLiveInstance {
                app: self.spec.name.clone(),
            })
    }

    fn update_status(&self, status: LifecycleStatus) {
        let mut state = self.lock();
        if state.status == status {
            return;
        }
        info!(
            app = %self.spec.name,
            endpoint = self.transport.host(),
            from = %state.status,
            to = %status,
            "lifecycle status changed"
        );
        state.status = status;
    }
}

#[async_trait]
impl<T: Transport, L: HostnameLookup> Deregister for RegistrationClient<T, L> {
    fn endpoint(&self) -> &str {
        self.transport.host()
    }

    async fn deregister(&self) -> Result<(), RegistrationError> {
        info!(
            app = %self.spec.name,
            hostname = %self.spec.hostname,
            endpoint = self.transport.host(),
            "sending de-registration request"
        );
        let instance_id = self.live_instance_id()?;

        tokio::time::sleep(self.grace).await;

        let uri = self.endpoint.instance_uri(&self.spec.name, &instance_id);
        if let Err(e) = self.transport.delete(&uri, StatusCode::OK).await {
            warn!(app = %self.spec.name, endpoint = self.transport.host(), %instance_id, error = %e, "de-registration failed");
            return Err(e.into());
        }

        {
            let mut state = self.lock();
            if state
                .instance
                .as_ref()
                .is_some_and(|instance| instance.instance_id == instance_id)
            {
                state.instance = None;
            }
        }
        self.update_status(LifecycleStatus::Deregistered);
        Ok(())
    }
}

#[async_trait]
impl<T: Transport, L: HostnameLookup> Lifecycle for RegistrationClient<T, L> {
    fn status(&self) -> LifecycleStatus {
        self.lock().status
    }

    async fn register(&self) -> Result<(), RegistrationError> {
        info!(
            app = %self.spec.name,
            hostname = %self.spec.hostname,
            endpoint = self.transport.host(),
            "sending registration request"
        );

        // A fresh descriptor before every registration.
        let instance = self.resolver.resolve(&self.spec, &self.metadata, InstanceStatus::Up).await;
        let body = serde_json::to_string(&InstanceEnvelope { instance: &instance });
        let instance_id = instance.instance_id.clone();
        self.lock().instance = Some(instance);

        let body = match body {
            Ok(body) => body,
            Err(e) => {
                error!(app = %self.spec.name, error = %e, "instance descriptor serialization failed");
                return Err(RegistrationError::Serialization(e));
            }
        };

        let uri = self.endpoint.application_uri(&self.spec.name);
        if let Err(e) = self.transport.post(&uri, body, StatusCode::NO_CONTENT).await {
            warn!(app = %self.spec.name, endpoint = self.transport.host(), %instance_id, error = %e, "registration failed");
            return Err(e.into());
        }

        self.update_status(LifecycleStatus::Registered);
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), RegistrationError> {
        debug!(
            app = %self.spec.name,
            hostname = %self.spec.hostname,
            endpoint = self.transport.host(),
            "sending keep-alive request"
        );
        let instance_id = self.live_instance_id()?;

        let uri = self.endpoint.instance_uri(&self.spec.name, &instance_id);
        if let Err(e) = self.transport.put(&uri, StatusCode::OK).await {
            warn!(app = %self.spec.name, endpoint = self.transport.host(), %instance_id, error = %e, "keep-alive failed");
            return Err(e.into());
        }

        self.update_status(LifecycleStatus::KeepAlive);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use registrar_common::{DataCenterKind, RegistrationPort};
    use reqwest::Method;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct Call {
        pub method: Method,
        pub uri: String,
        pub body: Option<String>,
        pub expected: StatusCode,
    }

    /// Records every call and answers with the queued statuses, defaulting to the expected one.
    #[derive(Default)]
    pub(crate) struct StubTransport {
        pub calls: Mutex<Vec<Call>>,
        pub responses: Mutex<VecDeque<StatusCode>>,
    }

    impl StubTransport {
        pub fn answering(statuses: impl IntoIterator<Item = StatusCode>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(statuses.into_iter().collect()),
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn answer(&self, method: Method, uri: &str, body: Option<String>, expected: StatusCode) -> Result<String, TransportError> {
            self.calls.lock().unwrap().push(Call {
                method: method.clone(),
                uri: uri.to_string(),
                body,
                expected,
            });
            let actual = self.responses.lock().unwrap().pop_front().unwrap_or(expected);
            if actual == expected {
                Ok(String::new())
            } else {
                Err(TransportError::StatusMismatch {
                    method,
                    url: uri.to_string(),
                    expected,
                    actual,
                })
            }
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn host(&self) -> &str {
            "discovery.example.com"
        }

        async fn get(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError> {
            self.answer(Method::GET, uri, None, expected)
        }

        async fn post(&self, uri: &str, body: String, expected: StatusCode) -> Result<String, TransportError> {
            self.answer(Method::POST, uri, Some(body), expected)
        }

        async fn put(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError> {
            self.answer(Method::PUT, uri, None, expected)
        }

        async fn delete(&self, uri: &str, expected: StatusCode) -> Result<String, TransportError> {
            self.answer(Method::DELETE, uri, None, expected)
        }
    }

    pub(crate) fn neo4j_spec() -> RegistrationSpec {
        let mut spec = RegistrationSpec::new("neo4j", "neo4j.example.com", RegistrationPort { port: 7474, enabled: true });
        spec.ip_address = Some("127.0.0.1".to_string());
        spec.aws_dns_hostname = true;
        spec.secure_port = RegistrationPort { port: 7473, enabled: false };
        spec
    }

    pub(crate) fn client(transport: Arc<StubTransport>) -> RegistrationClient<Arc<StubTransport>> {
        RegistrationClient::new(
            neo4j_spec(),
            RegistryEndpoint::new("discovery.example.com", 8761),
            transport,
            CloudMetadata::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn register_posts_descriptor() {
        let transport = Arc::new(StubTransport::default());
        let client = client(transport.clone());

        client.register().await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, Method::POST);
        assert_eq!(calls[0].uri, "/apps/neo4j");
        assert_eq!(calls[0].expected, StatusCode::NO_CONTENT);

        let body: InstanceEnvelope = serde_json::from_str(calls[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body.instance.instance_id, "neo4j:neo4j:7474");
        assert_eq!(body.instance.status, InstanceStatus::Up);
        assert_eq!(body.instance.data_center_info.kind(), DataCenterKind::Own);
        assert_eq!(client.status(), LifecycleStatus::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_moves_through_states() {
        let transport = Arc::new(StubTransport::default());
        let client = client(transport.clone());

        client.register().await.unwrap();
        client.keep_alive().await.unwrap();
        assert_eq!(client.status(), LifecycleStatus::KeepAlive);
        client.deregister().await.unwrap();
        assert_eq!(client.status(), LifecycleStatus::Deregistered);
        assert!(client.instance().is_none());

        let calls = transport.calls();
        assert_eq!(calls[1].method, Method::PUT);
        assert_eq!(calls[1].uri, "/apps/neo4j/neo4j:neo4j:7474");
        assert_eq!(calls[1].expected, StatusCode::OK);
        assert_eq!(calls[2].method, Method::DELETE);
        assert_eq!(calls[2].uri, "/apps/neo4j/neo4j:neo4j:7474");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_registration_keeps_descriptor_for_cleanup() {
        let transport = Arc::new(StubTransport::answering([StatusCode::INTERNAL_SERVER_ERROR]));
        let client = client(transport.clone());

        let err = client.register().await.unwrap_err();
        assert!(matches!(err, RegistrationError::Transport(TransportError::StatusMismatch { .. })));
        assert!(!err.is_fatal());
        assert_eq!(client.status(), LifecycleStatus::Unknown);
        assert!(client.instance().is_some());

        client.deregister().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn renew_and_remove_require_live_instance() {
        let transport = Arc::new(StubTransport::default());
        let client = client(transport.clone());

        assert!(matches!(client.keep_alive().await, Err(RegistrationError::NoLiveInstance { .. })));
        assert!(matches!(client.deregister().await, Err(RegistrationError::NoLiveInstance { .. })));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_waits_for_grace_period() {
        let transport = Arc::new(StubTransport::default());
        let client = client(transport.clone());
        client.register().await.unwrap();

        let started = tokio::time::Instant::now();
        client.deregister().await.unwrap();
        assert!(started.elapsed() >= DEREGISTER_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_grace_is_configurable() {
        let transport = Arc::new(StubTransport::default());
        let grace = Duration::from_millis(250);
        let client = client(transport.clone()).with_deregister_grace(grace);
        client.register().await.unwrap();

        let started = tokio::time::Instant::now();
        client.deregister().await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= grace);
        assert!(elapsed < DEREGISTER_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn second_deregister_fails() {
        let transport = Arc::new(StubTransport::default());
        let client = client(transport.clone());
        client.register().await.unwrap();

        client.deregister().await.unwrap();
        assert!(client.deregister().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delete_surfaces_transport_error_and_keeps_instance() {
        let transport = Arc::new(StubTransport::answering([StatusCode::NO_CONTENT, StatusCode::NOT_FOUND]));
        let client = client(transport.clone());
        client.register().await.unwrap();

        let err = client.deregister().await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Transport(TransportError::StatusMismatch { actual: StatusCode::NOT_FOUND, .. })
        ));
        assert!(client.instance().is_some());
        assert_eq!(client.status(), LifecycleStatus::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn context_path_prefixes_uris() {
        let transport = Arc::new(StubTransport::default());
        let mut endpoint = RegistryEndpoint::new("discovery.example.com", 8761);
        endpoint.context_path = "/eureka".to_string();
        let client = RegistrationClient::new(neo4j_spec(), endpoint, transport.clone(), CloudMetadata::new());

        client.register().await.unwrap();
        client.keep_alive().await.unwrap();

        let uris: Vec<String> = transport.calls().into_iter().map(|call| call.uri).collect();
        assert_eq!(uris, ["/eureka/apps/neo4j", "/eureka/apps/neo4j/neo4j:neo4j:7474"]);
    }
}
