// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration structures for the EKS control-plane manager.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while resolving the process configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid address {value:?} for --{flag}: {reason}")]
    InvalidAddress {
        flag: &'static str,
        value: String,
        reason: String,
    },

    #[error("--ekscontrolplane-concurrency must be a positive integer, got {0}")]
    InvalidConcurrency(usize),

    #[error("--webhook-port must be non-zero")]
    InvalidWebhookPort,

    #[error("invalid feature gates {value:?}: {source}")]
    FeatureGates {
        value: String,
        #[source]
        source: crate::feature::FeatureGateError,
    },
}

/// Resolved configuration of the manager process.
///
/// Built once from command-line flags (optionally layered over a YAML file)
/// and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// The address the metric endpoint binds to.
    #[serde(default = "default_metrics_bind_addr")]
    pub metrics_bind_addr: String,

    /// Whether to run leader election before starting controllers.
    #[serde(default)]
    pub leader_elect: bool,

    /// Namespace that controllers watch. Empty means all namespaces.
    #[serde(default)]
    pub namespace: String,

    /// Value of the watch-filter label. Empty means all objects.
    #[serde(default)]
    pub watch_filter_value: String,

    /// Bind address of the profiler endpoint, disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiler_address: Option<String>,

    /// Number of EKS control planes to process simultaneously.
    #[serde(default = "default_ekscontrolplane_concurrency")]
    pub ekscontrolplane_concurrency: usize,

    /// Interval at which watched resources are reconciled.
    #[serde(default = "default_sync_period", with = "humantime_serde")]
    pub sync_period: Duration,

    /// Webhook server port.
    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,

    /// Directory containing `tls.crt` and `tls.key` for the webhook server.
    #[serde(default = "default_webhook_cert_dir")]
    pub webhook_cert_dir: PathBuf,

    /// The address the health probe endpoint binds to.
    #[serde(default = "default_health_addr")]
    pub health_addr: String,

    /// Raw service endpoint overrides, see [`crate::endpoints::parse`].
    #[serde(default)]
    pub service_endpoints: String,

    /// Raw feature gate overrides (`Name=bool,...`).
    #[serde(default)]
    pub feature_gates: String,

    /// Kubeconfig used to talk to the apiserver. Inferred when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Directory holding the leader election lock.
    #[serde(default = "default_leader_election_lock_dir")]
    pub leader_election_lock_dir: PathBuf,

    /// Time allowed for controllers to drain after cancellation.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            metrics_bind_addr: default_metrics_bind_addr(),
            leader_elect: false,
            namespace: String::new(),
            watch_filter_value: String::new(),
            profiler_address: None,
            ekscontrolplane_concurrency: default_ekscontrolplane_concurrency(),
            sync_period: default_sync_period(),
            webhook_port: default_webhook_port(),
            webhook_cert_dir: default_webhook_cert_dir(),
            health_addr: default_health_addr(),
            service_endpoints: String::new(),
            feature_gates: String::new(),
            kubeconfig: None,
            leader_election_lock_dir: default_leader_election_lock_dir(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ManagerConfig {
    /// Loads a configuration file, filling unset fields with defaults.
    pub async fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;

        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks flag shapes that the guard does not own.
    ///
    /// Range checks on the sync period, endpoint grammar and feature gate
    /// consistency live in [`crate::guard`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ekscontrolplane_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(0));
        }
        if self.webhook_port == 0 {
            return Err(ConfigError::InvalidWebhookPort);
        }

        BindAddress::parse_flag("metrics-bind-addr", &self.metrics_bind_addr)?;
        BindAddress::parse_flag("health-addr", &self.health_addr)?;
        if let Some(addr) = &self.profiler_address {
            BindAddress::parse_flag("profiler-address", addr)?;
        }
        Ok(())
    }

    /// Returns the metrics address, `None` when disabled.
    pub fn metrics_address(&self) -> Result<Option<BindAddress>, ConfigError> {
        BindAddress::parse_flag("metrics-bind-addr", &self.metrics_bind_addr)
    }

    /// Returns the health probe address, `None` when disabled.
    pub fn health_address(&self) -> Result<Option<BindAddress>, ConfigError> {
        BindAddress::parse_flag("health-addr", &self.health_addr)
    }

    /// Returns the profiler address, `None` when disabled.
    pub fn profiler_bind_address(&self) -> Result<Option<BindAddress>, ConfigError> {
        match &self.profiler_address {
            Some(addr) => BindAddress::parse_flag("profiler-address", addr),
            None => Ok(None),
        }
    }
}

fn default_metrics_bind_addr() -> String {
    ":8080".to_string()
}

fn default_ekscontrolplane_concurrency() -> usize {
    10
}

fn default_sync_period() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_webhook_port() -> u16 {
    9443
}

fn default_webhook_cert_dir() -> PathBuf {
    PathBuf::from("/tmp/k8s-webhook-server/serving-certs/")
}

fn default_health_addr() -> String {
    ":9440".to_string()
}

fn default_leader_election_lock_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// A `host:port` listen address in the `:8080` shorthand used by the flags.
///
/// An empty host binds every interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddress {
    host: String,
    port: u16,
}

impl BindAddress {
    /// Parses a flag value. Empty strings and `"0"` disable the endpoint.
    pub fn parse_flag(flag: &'static str, value: &str) -> Result<Option<Self>, ConfigError> {
        let value = value.trim();
        if value.is_empty() || value == "0" {
            return Ok(None);
        }
        value
            .parse()
            .map(Some)
            .map_err(|reason| ConfigError::InvalidAddress {
                flag,
                value: value.to_string(),
                reason,
            })
    }

    /// Host part, empty for all interfaces.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns a string accepted by `TcpListener::bind`.
    pub fn to_listen_string(&self) -> String {
        if self.host.is_empty() {
            format!("0.0.0.0:{}", self.port)
        } else if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BindAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| "missing port".to_string())?;

        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port {:?}: {}", port, e))?;

        if host.chars().any(char::is_whitespace) {
            return Err("host contains whitespace".to_string());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Duration (de)serialization using the human-readable format (`10m`, `30s`).
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.metrics_bind_addr, ":8080");
        assert!(!config.leader_elect);
        assert_eq!(config.namespace, "");
        assert_eq!(config.ekscontrolplane_concurrency, 10);
        assert_eq!(config.sync_period, Duration::from_secs(600));
        assert_eq!(config.webhook_port, 9443);
        assert_eq!(
            config.webhook_cert_dir,
            PathBuf::from("/tmp/k8s-webhook-server/serving-certs/")
        );
        assert!(config.profiler_address.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let yaml = r#"
leaderElect: true
namespace: capa-system
syncPeriod: 5m
serviceEndpoints: "us-east-1:iam=https://iam.example"
"#;

        let config: ManagerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.leader_elect);
        assert_eq!(config.namespace, "capa-system");
        assert_eq!(config.sync_period, Duration::from_secs(300));
        assert_eq!(config.service_endpoints, "us-east-1:iam=https://iam.example");
        // untouched fields keep their defaults
        assert_eq!(config.webhook_port, 9443);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = ManagerConfig {
            ekscontrolplane_concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConcurrency(0))
        ));
    }

    #[test]
    fn test_bind_address_shorthand() {
        let addr = BindAddress::parse_flag("metrics-bind-addr", ":8080")
            .unwrap()
            .unwrap();
        assert_eq!(addr.host(), "");
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.to_listen_string(), "0.0.0.0:8080");

        let addr = BindAddress::parse_flag("profiler-address", "localhost:6060")
            .unwrap()
            .unwrap();
        assert_eq!(addr.to_listen_string(), "localhost:6060");
    }

    #[test]
    fn test_bind_address_disabled() {
        assert!(BindAddress::parse_flag("health-addr", "").unwrap().is_none());
        assert!(BindAddress::parse_flag("health-addr", "0").unwrap().is_none());
    }

    #[test]
    fn test_bind_address_invalid() {
        let err = BindAddress::parse_flag("metrics-bind-addr", "8080").unwrap_err();
        assert!(err.to_string().contains("metrics-bind-addr"));

        let err = BindAddress::parse_flag("metrics-bind-addr", ":http").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { .. }));
    }
}
