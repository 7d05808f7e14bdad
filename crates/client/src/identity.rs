//! Builds the instance descriptor sent to the registry.

use async_trait::async_trait;
use registrar_common::{
    CloudMetadata, DataCenterInfo, InstanceDescriptor, InstanceStatus, MetadataKey, RegistrationSpec,
    ResolvedAddress,
};
use std::net::IpAddr;
use tracing::{info, warn};

/// Reverse DNS lookup of an address.
#[async_trait]
pub trait HostnameLookup: Send + Sync {
    async fn hostname_for(&self, ip: &str) -> Option<String>;
}

/// Uses the operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

#[async_trait]
impl HostnameLookup for SystemLookup {
    async fn hostname_for(&self, ip: &str) -> Option<String> {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(ip, error = %e, "not an IP address, keeping the cloud hostname");
                return None;
            }
        };

        match tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr)).await {
            Ok(Ok(name)) => Some(name),
            Ok(Err(e)) => {
                warn!(ip, error = %e, "hostname lookup failed, keeping the cloud hostname");
                None
            }
            Err(e) => {
                warn!(ip, error = %e, "hostname lookup task failed");
                None
            }
        }
    }
}

/// `lower(id:name:port)`, e.g. `i-0f84ec0b4c02e7878:neo4j:7474`.
pub fn instance_id(id: &str, spec: &RegistrationSpec) -> String {
    format!("{}:{}:{}", id, spec.name, spec.port.port).to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct IdentityResolver<L = SystemLookup> {
    lookup: L,
}

impl IdentityResolver<SystemLookup> {
    pub fn new() -> Self {
        Self { lookup: SystemLookup }
    }
}

impl<L: HostnameLookup> IdentityResolver<L> {
    pub fn with_lookup(lookup: L) -> Self {
        Self { lookup }
    }

    pub async fn resolve_default(&self, spec: &RegistrationSpec, metadata: &CloudMetadata) -> InstanceDescriptor {
        self.resolve(spec, metadata, InstanceStatus::Starting).await
    }

    pub async fn resolve(
        &self,
        spec: &RegistrationSpec,
        metadata: &CloudMetadata,
        status: InstanceStatus,
    ) -> InstanceDescriptor {
        let (address, data_center) = if metadata.is_empty() {
            info!(app = %spec.name, "using own data center information");
            let address = ResolvedAddress {
                instance_id: instance_id(&spec.name, spec),
                host_name: spec.hostname.clone(),
                ip_addr: spec.ip_address.clone(),
            };
            (address, DataCenterInfo::own())
        } else {
            info!(app = %spec.name, "using cloud data center information");
            let address = self.cloud_address(spec, metadata).await;
            (address, DataCenterInfo::cloud(metadata.clone()))
        };

        info!(
            app = %spec.name,
            instance_id = %address.instance_id,
            hostname = %address.host_name,
            ip = address.ip_addr.as_deref().unwrap_or("-"),
            "resolved instance identity"
        );
        InstanceDescriptor::new(spec, address, data_center, status)
    }

    async fn cloud_address(&self, spec: &RegistrationSpec, metadata: &CloudMetadata) -> ResolvedAddress {
        let id = metadata.get(MetadataKey::InstanceId).unwrap_or(&spec.name);
        let ip_addr = metadata
            .get(MetadataKey::LocalIpv4)
            .map(str::to_string)
            .or_else(|| spec.ip_address.clone());
        let mut host_name = metadata
            .get(MetadataKey::LocalHostname)
            .unwrap_or(&spec.hostname)
            .to_string();

        if spec.aws_dns_hostname {
            if let Some(ip) = ip_addr.as_deref() {
                if let Some(resolved) = self.lookup.hostname_for(ip).await {
                    info!(cloud = %host_name, resolved = %resolved, "overriding cloud hostname");
                    host_name = resolved;
                }
            }
        }

        ResolvedAddress {
            instance_id: instance_id(id, spec),
            host_name,
            ip_addr,
        }
    }
}
