//! Controller configuration.
//!
//! Loaded from a TOML file. Every section and field is optional; absent
//! values take the defaults below.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use df_model::MacAddress;
use df_nb::{DriverConfig, EtcdConfig, UpdatePolicy};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Update discipline as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicySetting {
    CompareAndSwap,
    ReadModifyWrite,
}

impl From<UpdatePolicySetting> for UpdatePolicy {
    fn from(setting: UpdatePolicySetting) -> Self {
        match setting {
            UpdatePolicySetting::CompareAndSwap => UpdatePolicy::CompareAndSwap,
            UpdatePolicySetting::ReadModifyWrite => UpdatePolicy::ReadModifyWrite,
        }
    }
}

/// Northbound store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Longest a watch long-poll may block
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_update_policy")]
    pub update_policy: UpdatePolicySetting,

    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: u32,

    /// List the whole store before watching
    #[serde(default = "default_true")]
    pub initial_sync: bool,
}

/// Label switching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MplsConfig {
    #[serde(default = "default_bridge")]
    pub bridge: String,

    /// Address the ARP responder answers for
    #[serde(default = "default_interface_ip")]
    pub interface_ip: String,

    /// MAC of the local uplink
    #[serde(default = "default_mpls_mac")]
    pub mac: String,

    /// Interface name of the uplink
    #[serde(default = "default_uplink_port")]
    pub uplink_port: String,

    #[serde(default)]
    pub idle_timeout: u16,

    #[serde(default)]
    pub hard_timeout: u16,

    /// Next-hop IP to MAC. Static until next-hop resolution exists.
    #[serde(default)]
    pub nexthop_macs: BTreeMap<String, String>,
}

/// Pipeline mutation retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

/// Complete controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub nb: NbConfig,

    #[serde(default)]
    pub mpls: MplsConfig,

    /// Interface name to datapath port number
    #[serde(default)]
    pub ports: BTreeMap<String, u32>,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:2379".to_string()
}

fn default_watch_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    5
}

fn default_update_policy() -> UpdatePolicySetting {
    UpdatePolicySetting::CompareAndSwap
}

fn default_max_update_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_bridge() -> String {
    "br-int".to_string()
}

fn default_interface_ip() -> String {
    "1.1.1.1".to_string()
}

fn default_mpls_mac() -> String {
    "00:00:00:00:00:11".to_string()
}

fn default_uplink_port() -> String {
    "eth1".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    50
}

fn default_backoff_multiplier() -> u32 {
    2
}

impl Default for NbConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            watch_timeout_secs: default_watch_timeout(),
            request_timeout_secs: default_request_timeout(),
            update_policy: default_update_policy(),
            max_update_attempts: default_max_update_attempts(),
            initial_sync: true,
        }
    }
}

impl Default for MplsConfig {
    fn default() -> Self {
        Self {
            bridge: default_bridge(),
            interface_ip: default_interface_ip(),
            mac: default_mpls_mac(),
            uplink_port: default_uplink_port(),
            idle_timeout: 0,
            hard_timeout: 0,
            nexthop_macs: BTreeMap::new(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Label switching settings with every value parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MplsSettings {
    pub bridge: String,
    pub interface_ip: Ipv4Addr,
    pub mac: MacAddress,
    pub uplink_port: String,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub nexthop_macs: HashMap<IpAddr, MacAddress>,
}

/// Pipeline mutation retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        PipelineConfig::default().retry_policy()
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.into(),
    }
}

impl ControllerConfig {
    /// Loads and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parses and validates a config document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nb.backend_url.is_empty() {
            return Err(invalid("nb.backend_url", "must not be empty"));
        }
        if self.nb.max_update_attempts == 0 {
            return Err(invalid("nb.max_update_attempts", "must be > 0"));
        }
        if self.nb.watch_timeout_secs == 0 {
            return Err(invalid("nb.watch_timeout_secs", "must be > 0"));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(invalid("pipeline.max_attempts", "must be > 0"));
        }
        if self.pipeline.backoff_multiplier == 0 {
            return Err(invalid("pipeline.backoff_multiplier", "must be > 0"));
        }
        let mpls = self.mpls_settings()?;
        if !self.ports.contains_key(&mpls.uplink_port) {
            return Err(invalid(
                &format!("ports.{}", mpls.uplink_port),
                "no port number for the uplink",
            ));
        }
        Ok(())
    }

    /// Parsed label switching settings.
    pub fn mpls_settings(&self) -> Result<MplsSettings, ConfigError> {
        let mpls = &self.mpls;
        let interface_ip = mpls
            .interface_ip
            .parse()
            .map_err(|_| invalid("mpls.interface_ip", format!("'{}' is not an IPv4 address", mpls.interface_ip)))?;
        let mac = mpls
            .mac
            .parse()
            .map_err(|e| invalid("mpls.mac", format!("{e}")))?;
        if mpls.uplink_port.is_empty() {
            return Err(invalid("mpls.uplink_port", "must not be empty"));
        }

        let mut nexthop_macs = HashMap::new();
        for (ip, mac) in &mpls.nexthop_macs {
            let ip: IpAddr = ip.parse().map_err(|_| {
                invalid("mpls.nexthop_macs", format!("'{ip}' is not an IP address"))
            })?;
            let mac: MacAddress = mac
                .parse()
                .map_err(|e| invalid("mpls.nexthop_macs", format!("{e}")))?;
            nexthop_macs.insert(ip, mac);
        }

        Ok(MplsSettings {
            bridge: mpls.bridge.clone(),
            interface_ip,
            mac,
            uplink_port: mpls.uplink_port.clone(),
            idle_timeout: mpls.idle_timeout,
            hard_timeout: mpls.hard_timeout,
            nexthop_macs,
        })
    }

    pub fn etcd_config(&self) -> EtcdConfig {
        EtcdConfig {
            url: self.nb.backend_url.clone(),
            request_timeout: Duration::from_secs(self.nb.request_timeout_secs),
            watch_timeout: Duration::from_secs(self.nb.watch_timeout_secs),
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            update_policy: self.nb.update_policy.into(),
            max_update_attempts: self.nb.max_update_attempts,
            initial_sync: self.nb.initial_sync,
        }
    }

    pub fn port_map(&self) -> HashMap<String, u32> {
        self.ports.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.nb.backend_url, "http://127.0.0.1:2379");
        assert_eq!(config.nb.update_policy, UpdatePolicySetting::CompareAndSwap);
        assert_eq!(config.mpls.bridge, "br-int");
        assert_eq!(config.pipeline.max_attempts, 3);

        let mpls = config.mpls_settings().unwrap();
        assert_eq!(mpls.interface_ip, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(mpls.mac.to_string(), "00:00:00:00:00:11");
        assert_eq!(mpls.uplink_port, "eth1");
    }

    #[test]
    fn test_partial_file() {
        let config = ControllerConfig::from_toml(
            r#"
            [nb]
            update_policy = "read-modify-write"

            [mpls]
            uplink_port = "eth2"

            [mpls.nexthop_macs]
            "192.0.2.254" = "2c:6b:f5:61:dd:94"

            [ports]
            eth2 = 18
            "#,
        )
        .unwrap();

        assert_eq!(config.driver_config().update_policy, UpdatePolicy::ReadModifyWrite);
        assert_eq!(config.nb.max_update_attempts, 5);
        assert_eq!(config.port_map().get("eth2"), Some(&18));

        let mpls = config.mpls_settings().unwrap();
        assert_eq!(
            mpls.nexthop_macs.get(&"192.0.2.254".parse::<IpAddr>().unwrap()),
            Some(&"2c:6b:f5:61:dd:94".parse().unwrap())
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ControllerConfig::from_toml("[mpls]\nmac = \"00:11\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "mpls.mac"));

        let err = ControllerConfig::from_toml("[mpls]\ninterface_ip = \"2001:db8::1\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "mpls.interface_ip"));

        let err = ControllerConfig::from_toml("[pipeline]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err =
            ControllerConfig::from_toml("[mpls.nexthop_macs]\n\"not-an-ip\" = \"00:00:00:00:00:01\"")
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "mpls.nexthop_macs"));
    }

    #[test]
    fn test_uplink_needs_port_number() {
        let err = ControllerConfig::from_toml("[ports]\neth2 = 18").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "ports.eth1"));
        assert!(ControllerConfig::default().validate().is_err());

        let config = ControllerConfig::from_toml("[mpls]\nuplink_port = \"eth2\"\n[ports]\neth2 = 18");
        assert!(config.is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[nb]\nbackend_url = \"http://etcd:2379\"\n[ports]\neth1 = 18").unwrap();

        let config = ControllerConfig::load(file.path()).unwrap();
        assert_eq!(config.etcd_config().url, "http://etcd:2379");
    }

    #[test]
    fn test_load_errors_name_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[nb\n").unwrap();
        let err = ControllerConfig::load(file.path()).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path().display().to_string()),
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            ControllerConfig::load("/nonexistent/df.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
