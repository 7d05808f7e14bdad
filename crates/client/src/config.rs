use crate::metadata::{DEFAULT_METADATA_HOST, DEFAULT_METADATA_PATH, DEFAULT_METADATA_PORT};
use crate::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use crate::supervisor::DEFAULT_KEEP_ALIVE_INTERVAL;
use crate::transport::DEFAULT_REQUEST_TIMEOUT;
use registrar_common::{InvalidRegistration, RegistrationSpec, RegistryEndpoint};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "conf/registrar.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid registration: {0}")]
    Registration(#[from] InvalidRegistration),
    #[error("at least one registry service must be configured")]
    NoServices,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub services: Vec<RegistryEndpoint>,
    pub registration: RegistrationSpec,
    #[serde(default)]
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    pub keep_alive_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub cloud_metadata: CloudMetadataSettings,
    pub health: Option<HealthSettings>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            keep_alive_interval_secs: DEFAULT_KEEP_ALIVE_INTERVAL.as_secs(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
            cloud_metadata: CloudMetadataSettings::default(),
            health: None,
        }
    }
}

impl AgentSettings {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudMetadataSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for CloudMetadataSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: DEFAULT_METADATA_HOST.to_string(),
            port: DEFAULT_METADATA_PORT,
            path: DEFAULT_METADATA_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSettings {
    pub listen: SocketAddr,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(raw)?;
        for service in &mut config.services {
            service.host = service.host.trim().to_string();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }
        self.registration.validate()?;
        if self.agent.keep_alive_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("keepAliveIntervalSecs"));
        }
        if self.agent.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("requestTimeoutSecs"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SERVICES: &str = r#"
services:
  - host: discovery1.example.com
    port: 8761
  - host: " discovery2.example.com "
    port: 8762
    contextPath: /eureka
registration:
  name: neo4j
  hostname: neo4j.example.com
  ipAddress: 127.0.0.1
  awsDnsHostname: true
  vipAddress: neo4j
  port:
    port: 7474
    enabled: true
  securePort:
    port: 7473
    enabled: false
  statusPageUrl: http://neo4j.example.com:7474/browser
  healthCheckUrl: http://neo4j.example.com:7474/health
  homePageUrl: http://neo4j.example.com:7474/
"#;

    #[test]
    fn loads_services_and_registration() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SERVICES.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].host, "discovery1.example.com");
        assert_eq!(config.services[0].port, 8761);
        assert_eq!(config.services[0].context_path, "");
        assert_eq!(config.services[1].host, "discovery2.example.com");
        assert_eq!(config.services[1].context_path, "/eureka");

        let registration = &config.registration;
        assert_eq!(registration.name, "neo4j");
        assert_eq!(registration.hostname, "neo4j.example.com");
        assert_eq!(registration.ip_address.as_deref(), Some("127.0.0.1"));
        assert!(registration.aws_dns_hostname);
        assert_eq!(registration.vip_address.as_deref(), Some("neo4j"));
        assert_eq!(registration.port.port, 7474);
        assert!(registration.port.enabled);
        assert_eq!(registration.secure_port.port, 7473);
        assert!(!registration.secure_port.enabled);
        assert_eq!(
            registration.status_page_url.as_deref(),
            Some("http://neo4j.example.com:7474/browser")
        );

        assert_eq!(config.agent.keep_alive_interval(), DEFAULT_KEEP_ALIVE_INTERVAL);
        assert!(!config.agent.cloud_metadata.enabled);
        assert!(config.agent.health.is_none());
    }

    #[test]
    fn agent_settings_override_defaults() {
        let raw = format!(
            "{SERVICES}agent:\n  keepAliveIntervalSecs: 5\n  cloudMetadata:\n    enabled: true\n  health:\n    listen: 127.0.0.1:8081\n"
        );
        let config = Config::from_yaml(&raw).unwrap();

        assert_eq!(config.agent.keep_alive_interval(), Duration::from_secs(5));
        assert_eq!(config.agent.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
        assert!(config.agent.cloud_metadata.enabled);
        assert_eq!(config.agent.cloud_metadata.host, DEFAULT_METADATA_HOST);
        assert_eq!(config.agent.health.unwrap().listen, "127.0.0.1:8081".parse().unwrap());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load("does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn missing_required_field_is_a_parse_error() {
        let err = Config::from_yaml("services: []\nregistration:\n  hostname: neo4j.example.com\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_services_are_rejected() {
        let raw = SERVICES.replace(
            "  - host: discovery1.example.com\n    port: 8761\n  - host: \" discovery2.example.com \"\n    port: 8762\n    contextPath: /eureka\n",
            "",
        );
        let raw = raw.replace("services:\n", "services: []\n");
        let err = Config::from_yaml(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::NoServices));
    }

    #[test]
    fn blank_name_is_rejected() {
        let raw = SERVICES.replace("  name: neo4j\n", "  name: \"\"\n");
        let err = Config::from_yaml(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::Registration(InvalidRegistration::MissingName)));
    }

    #[test]
    fn zero_keep_alive_interval_is_rejected() {
        let raw = format!("{SERVICES}agent:\n  keepAliveIntervalSecs: 0\n");
        let err = Config::from_yaml(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration("keepAliveIntervalSecs")));
    }

    #[test]
    fn zero_request_timeout_is_rejected() {
        let raw = format!("{SERVICES}agent:\n  requestTimeoutSecs: 0\n");
        let err = Config::from_yaml(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration("requestTimeoutSecs")));
        assert_eq!(err.to_string(), "requestTimeoutSecs must be greater than zero");
    }
}
