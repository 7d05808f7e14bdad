use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationPort {
    pub port: u16,
    pub enabled: bool,
}

/// Static registration settings, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSpec {
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub aws_dns_hostname: bool,
    #[serde(default)]
    pub vip_address: Option<String>,
    pub port: RegistrationPort,
    #[serde(default)]
    pub secure_port: RegistrationPort,
    #[serde(default)]
    pub status_page_url: Option<String>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub home_page_url: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidRegistration {
    #[error("registration name is required")]
    MissingName,
    #[error("registration hostname is required")]
    MissingHostname,
    #[error("registration port must be non-zero")]
    MissingPort,
}

impl RegistrationSpec {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, port: RegistrationPort) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            ip_address: None,
            aws_dns_hostname: false,
            vip_address: None,
            port,
            secure_port: RegistrationPort::default(),
            status_page_url: None,
            health_check_url: None,
            home_page_url: None,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidRegistration> {
        if self.name.trim().is_empty() {
            return Err(InvalidRegistration::MissingName);
        }
        if self.hostname.trim().is_empty() {
            return Err(InvalidRegistration::MissingHostname);
        }
        if self.port.port == 0 {
            return Err(InvalidRegistration::MissingPort);
        }
        Ok(())
    }
}

/// One discovery-service node. `context_path` prefixes every registry URI (e.g. `/eureka`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub context_path: String,
}

impl RegistryEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().trim().to_string(),
            port,
            context_path: String::new(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host.trim(), self.port)
    }

    pub fn application_uri(&self, app: &str) -> String {
        format!("{}/apps/{}", self.context_path.trim_end_matches('/'), app)
    }

    pub fn instance_uri(&self, app: &str, instance_id: &str) -> String {
        format!("{}/{}", self.application_uri(app), instance_id)
    }
}

impl fmt::Display for RegistryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Up,
    Starting,
    Unknown,
}

/// Advisory lifecycle state of one registration client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Unknown,
    Registered,
    KeepAlive,
    Deregistered,
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleStatus::Unknown => "UNKNOWN",
            LifecycleStatus::Registered => "REGISTERED",
            LifecycleStatus::KeepAlive => "KEEP_ALIVE",
            LifecycleStatus::Deregistered => "DEREGISTERED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    InstanceId,
    LocalIpv4,
    LocalHostname,
    PublicHostname,
    PublicIpv4,
    AvailabilityZone,
}

impl MetadataKey {
    /// Probe order. The instance id comes first.
    pub const ALL: [MetadataKey; 6] = [
        MetadataKey::InstanceId,
        MetadataKey::LocalIpv4,
        MetadataKey::LocalHostname,
        MetadataKey::PublicHostname,
        MetadataKey::PublicIpv4,
        MetadataKey::AvailabilityZone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKey::InstanceId => "instance-id",
            MetadataKey::LocalIpv4 => "local-ipv4",
            MetadataKey::LocalHostname => "local-hostname",
            MetadataKey::PublicHostname => "public-hostname",
            MetadataKey::PublicIpv4 => "public-ipv4",
            MetadataKey::AvailabilityZone => "placement/availability-zone",
        }
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values reported by the cloud metadata service. Any key may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudMetadata(BTreeMap<String, String>);

impl CloudMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: MetadataKey) -> Option<&str> {
        self.0.get(key.as_str()).map(String::as_str)
    }

    pub fn insert(&mut self, key: MetadataKey, value: impl Into<String>) {
        self.0.insert(key.as_str().to_string(), value.into());
    }

    pub fn contains(&self, key: MetadataKey) -> bool {
        self.0.contains_key(key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(MetadataKey, String)> for CloudMetadata {
    fn from_iter<I: IntoIterator<Item = (MetadataKey, String)>>(iter: I) -> Self {
        let mut metadata = CloudMetadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

// Eureka encodes a few booleans as "true"/"false" strings.
mod flag {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "true" } else { "false" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    #[serde(rename = "$")]
    pub port: u16,
    #[serde(rename = "@enabled", with = "flag")]
    pub enabled: bool,
}

impl From<&RegistrationPort> for PortInfo {
    fn from(port: &RegistrationPort) -> Self {
        Self {
            port: port.port,
            enabled: port.enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataCenterKind {
    #[serde(rename = "MyOwn")]
    Own,
    #[serde(rename = "Amazon")]
    Cloud,
}

const OWN_DATA_CENTER_CLASS: &str = "com.netflix.appinfo.InstanceInfo$DefaultDataCenterInfo";
const CLOUD_DATA_CENTER_CLASS: &str = "com.netflix.appinfo.AmazonInfo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCenterInfo {
    #[serde(rename = "@class")]
    pub class: String,
    pub name: DataCenterKind,
    #[serde(default, skip_serializing_if = "CloudMetadata::is_empty")]
    pub metadata: CloudMetadata,
}

impl DataCenterInfo {
    pub fn own() -> Self {
        Self {
            class: OWN_DATA_CENTER_CLASS.to_string(),
            name: DataCenterKind::Own,
            metadata: CloudMetadata::new(),
        }
    }

    pub fn cloud(metadata: CloudMetadata) -> Self {
        Self {
            class: CLOUD_DATA_CENTER_CLASS.to_string(),
            name: DataCenterKind::Cloud,
            metadata,
        }
    }

    pub fn kind(&self) -> DataCenterKind {
        self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    pub renewal_interval_in_secs: u32,
    pub duration_in_secs: u32,
    pub registration_timestamp: i64,
    pub last_renewal_timestamp: i64,
    pub eviction_timestamp: i64,
    pub service_up_timestamp: i64,
}

impl Default for LeaseInfo {
    fn default() -> Self {
        Self {
            renewal_interval_in_secs: 30,
            duration_in_secs: 90,
            registration_timestamp: 0,
            last_renewal_timestamp: 0,
            eviction_timestamp: 0,
            service_up_timestamp: 0,
        }
    }
}

/// Address part of an identity, already resolved from settings or cloud metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub instance_id: String,
    pub host_name: String,
    pub ip_addr: Option<String>,
}

/// The record sent to the registry. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescriptor {
    pub instance_id: String,
    pub host_name: String,
    pub app: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_addr: Option<String>,
    pub status: InstanceStatus,
    #[serde(rename = "overriddenstatus")]
    pub overridden_status: InstanceStatus,
    pub port: PortInfo,
    pub secure_port: PortInfo,
    pub data_center_info: DataCenterInfo,
    pub lease_info: LeaseInfo,
    pub metadata: BTreeMap<String, String>,
    pub app_group_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    #[serde(with = "flag")]
    pub is_coordinating_discovery_server: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated_timestamp: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_dirty_timestamp: DateTime<Utc>,
}

impl InstanceDescriptor {
    pub fn new(
        spec: &RegistrationSpec,
        address: ResolvedAddress,
        data_center_info: DataCenterInfo,
        status: InstanceStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: address.instance_id,
            host_name: address.host_name,
            app: spec.name.clone(),
            ip_addr: address.ip_addr,
            status,
            overridden_status: InstanceStatus::Unknown,
            port: PortInfo::from(&spec.port),
            secure_port: PortInfo::from(&spec.secure_port),
            data_center_info,
            lease_info: LeaseInfo::default(),
            metadata: BTreeMap::new(),
            app_group_name: "UNKNOWN".to_string(),
            vip_address: spec.vip_address.clone(),
            home_page_url: spec.home_page_url.clone(),
            status_page_url: spec.status_page_url.clone(),
            health_check_url: spec.health_check_url.clone(),
            is_coordinating_discovery_server: false,
            last_updated_timestamp: now,
            last_dirty_timestamp: now,
        }
    }
}

/// Root wrapper of the registration body: `{"instance": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEnvelope<I = InstanceDescriptor> {
    pub instance: I,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatusCode {
    Up,
    Down,
    OutOfService,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub code: HealthStatusCode,
    pub description: String,
}

impl HealthCheck {
    pub fn new(code: HealthStatusCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}
