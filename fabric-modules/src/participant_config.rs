//! Configuration structures for a participant: the values needed to join a
//! simulation (name, registry address, listen endpoints) and the operator
//! knobs that govern logging and health-check timeouts.
//!
//! Configurations are serialized with serde and use plain yaml, so they can
//! be checked in or generated by a demo program.

use std::time::Duration;

use flmacro::VersionedSerde;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fabric_arch::ids::ParticipantId;
use crate::model::ListenEndpoint;

/// Errors to be returned when loading or validating a participant config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("participant name must not be empty")]
    EmptyName,
    #[error("registry URI must be of the form silkit://host:port, got '{0}'")]
    BadRegistryUri(String),
    #[error(transparent)]
    DecodeYaml(#[from] serde_yaml::Error),
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSinkKind {
    Stdout,
    File,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Off,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Critical => log::LevelFilter::Error,
            LogLevel::Off => log::LevelFilter::Off,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSinkConfig {
    pub kind: LogSinkKind,
    pub level: LogLevel,
    /// Only meaningful for `File`; ignored otherwise.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        LogSinkConfig {
            kind: LogSinkKind::Stdout,
            level: LogLevel::Info,
            path: None,
        }
    }
}

/// Soft/hard timeouts for the step watchdog (component I).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            soft_timeout: Duration::from_secs(2),
            hard_timeout: Duration::from_secs(5),
        }
    }
}

/// An optional per-controller override: pin a named controller to a given
/// network name, overriding whatever the participant's own code requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerOverride {
    pub controller_name: String,
    pub network_name: String,
}

/// A `silkit://host:port` registry address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryUri {
    pub host: String,
    pub port: u16,
}

impl RegistryUri {
    const SCHEME: &'static str = "silkit://";

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let rest = s
            .strip_prefix(Self::SCHEME)
            .ok_or_else(|| ConfigError::BadRegistryUri(s.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::BadRegistryUri(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::BadRegistryUri(s.to_string()))?;
        if host.is_empty() {
            return Err(ConfigError::BadRegistryUri(s.to_string()));
        }
        Ok(RegistryUri {
            host: host.to_string(),
            port,
        })
    }

    pub fn as_endpoint(&self) -> ListenEndpoint {
        ListenEndpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl std::fmt::Display for RegistryUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}:{}", Self::SCHEME, self.host, self.port)
    }
}

impl Serialize for RegistryUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RegistryUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RegistryUri::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// ParticipantConfig is the configuration a demo program loads before
/// starting a participant: who it is, where the registry lives, and the
/// operator knobs for logging and health checks.
#[derive(VersionedSerde, Debug, Clone, PartialEq)]
#[versions = "[ParticipantConfigV1]"]
pub struct ParticipantConfig {
    pub participant_name: String,
    pub registry_uri: RegistryUri,
    #[serde(default)]
    pub listen_endpoints: Vec<ListenEndpoint>,
    #[serde(default = "default_log_sinks")]
    pub log_sinks: Vec<LogSinkConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub controller_overrides: Vec<ControllerOverride>,
}

fn default_log_sinks() -> Vec<LogSinkConfig> {
    vec![LogSinkConfig::default()]
}

impl ParticipantConfig {
    pub fn new(participant_name: &str, registry_uri: RegistryUri) -> Result<Self, ConfigError> {
        if participant_name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        Ok(ParticipantConfig {
            participant_name: participant_name.to_string(),
            registry_uri,
            listen_endpoints: Vec::new(),
            log_sinks: default_log_sinks(),
            health_check: HealthCheckConfig::default(),
            controller_overrides: Vec::new(),
        })
    }

    /// Deterministic id derived from the participant name, see
    /// [`ParticipantId::from_name`].
    pub fn participant_id(&self) -> ParticipantId {
        ParticipantId::from_name(&self.participant_name)
    }

    pub fn encode(&self) -> String {
        serde_yaml::to_string(self).unwrap()
    }

    pub fn decode(data: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_yaml::from_str(data)?;
        if cfg.participant_name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        Ok(cfg)
    }

    /// Override for the given controller name, if any.
    pub fn controller_network(&self, controller_name: &str) -> Option<&str> {
        self.controller_overrides
            .iter()
            .find(|o| o.controller_name == controller_name)
            .map(|o| o.network_name.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct ParticipantConfigV1 {
    participant_name: String,
    registry_uri: RegistryUri,
    listen_endpoints: Vec<ListenEndpoint>,
}

impl From<ParticipantConfigV1> for ParticipantConfig {
    fn from(old: ParticipantConfigV1) -> Self {
        ParticipantConfig {
            participant_name: old.participant_name,
            registry_uri: old.registry_uri,
            listen_endpoints: old.listen_endpoints,
            log_sinks: default_log_sinks(),
            health_check: HealthCheckConfig::default(),
            controller_overrides: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_registry_uri() {
        let uri = RegistryUri::parse("silkit://localhost:8500").unwrap();
        assert_eq!(uri.host, "localhost");
        assert_eq!(uri.port, 8500);
        assert_eq!(uri.to_string(), "silkit://localhost:8500");

        assert!(RegistryUri::parse("http://localhost:8500").is_err());
        assert!(RegistryUri::parse("silkit://:8500").is_err());
        assert!(RegistryUri::parse("silkit://localhost").is_err());
    }

    #[test]
    fn save_load_roundtrip() -> Result<(), ConfigError> {
        let cfg = ParticipantConfig::new("ECU1", RegistryUri::parse("silkit://localhost:8500")?)?;
        let encoded = cfg.encode();
        let decoded = ParticipantConfig::decode(&encoded)?;
        assert_eq!(cfg, decoded);
        Ok(())
    }

    #[test]
    fn empty_name_rejected() {
        let uri = RegistryUri::parse("silkit://localhost:8500").unwrap();
        assert!(matches!(
            ParticipantConfig::new("", uri),
            Err(ConfigError::EmptyName)
        ));
    }

    #[test]
    fn participant_id_stable() {
        let uri = RegistryUri::parse("silkit://localhost:8500").unwrap();
        let cfg = ParticipantConfig::new("ECU1", uri).unwrap();
        assert_eq!(cfg.participant_id(), ParticipantId::from_name("ECU1"));
    }

    #[test]
    fn v1_migration() -> Result<(), ConfigError> {
        let v1 = ParticipantConfigVersion::ParticipantConfigV1(ParticipantConfigV1 {
            participant_name: "ECU2".to_string(),
            registry_uri: RegistryUri::parse("silkit://localhost:8500")?,
            listen_endpoints: vec![],
        });
        let encoded = serde_yaml::to_string(&v1)?;
        let decoded = ParticipantConfig::decode(&encoded)?;
        assert_eq!(decoded.participant_name, "ECU2");
        assert_eq!(decoded.log_sinks, default_log_sinks());
        Ok(())
    }

    #[test]
    fn controller_override_lookup() {
        let uri = RegistryUri::parse("silkit://localhost:8500").unwrap();
        let mut cfg = ParticipantConfig::new("ECU1", uri).unwrap();
        cfg.controller_overrides.push(ControllerOverride {
            controller_name: "CAN1".to_string(),
            network_name: "PT_CAN".to_string(),
        });
        assert_eq!(cfg.controller_network("CAN1"), Some("PT_CAN"));
        assert_eq!(cfg.controller_network("CAN2"), None);
    }
}
