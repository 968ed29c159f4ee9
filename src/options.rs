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

//! Command-line flags.
//!
//! Every manager flag is optional so that it only overrides the value read
//! from `--config` (or the built-in default) when given.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{ConfigError, ManagerConfig};
use crate::feature::{capa, FeatureGateSet};

/// EKS control-plane manager
///
/// Runs the controllers and admission webhooks for AWSManagedControlPlane
/// resources.
#[derive(Parser, Debug, Clone)]
#[command(name = "eks-controlplane-manager")]
#[command(author = "Kubernetes Authors")]
#[command(version)]
#[command(about = "EKS control-plane manager", long_about = None)]
pub struct Options {
    /// Path to a YAML configuration file. Flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or a tracing filter directive
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub log_json: bool,

    /// The address the metric endpoint binds to
    #[arg(long)]
    pub metrics_bind_addr: Option<String>,

    /// Enable leader election for controller manager. Enabling this will
    /// ensure there is only one active controller manager.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub leader_elect: Option<bool>,

    /// Namespace that the controller watches to reconcile objects. If
    /// unspecified, the controller watches for objects across all namespaces.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Bind address to expose the diagnostics endpoint (e.g. localhost:6060)
    #[arg(long)]
    pub profiler_address: Option<String>,

    /// Number of EKS control planes to process simultaneously
    #[arg(long)]
    pub ekscontrolplane_concurrency: Option<usize>,

    /// The minimum interval at which watched resources are reconciled
    #[arg(long, value_parser = humantime::parse_duration)]
    pub sync_period: Option<Duration>,

    /// Webhook server port
    #[arg(long)]
    pub webhook_port: Option<u16>,

    /// Webhook certificate directory
    #[arg(long)]
    pub webhook_cert_dir: Option<PathBuf>,

    /// Set custom AWS service endpoints in semi-colon separated format:
    /// ${SigningRegion1}:${ServiceID1}=${URL},${ServiceID2}=${URL};${SigningRegion2}...
    #[arg(long)]
    pub service_endpoints: Option<String>,

    /// Label value that the controller watches to reconcile cluster-api
    /// objects. The label key is cluster.x-k8s.io/watch-filter.
    #[arg(long)]
    pub watch_filter: Option<String>,

    /// A set of key=value pairs that describe feature gates for alpha or
    /// experimental features
    #[arg(long)]
    pub feature_gates: Option<String>,

    /// The address the health endpoint binds to ("0" or "" disables it)
    #[arg(long)]
    pub health_addr: Option<String>,

    /// Path to the kubeconfig file. Inferred when unset.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Directory holding the leader election lock
    #[arg(long)]
    pub leader_election_lock_dir: Option<PathBuf>,

    /// Time allowed for controllers to stop after a shutdown signal
    #[arg(long, value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Option<Duration>,
}

impl Options {
    /// Resolves the configuration: built-in defaults, then `--config`,
    /// then flags.
    pub async fn resolve(&self) -> Result<(ManagerConfig, FeatureGateSet), ConfigError> {
        let base = match &self.config {
            Some(path) => ManagerConfig::from_file(path).await?,
            None => ManagerConfig::default(),
        };
        let config = self.apply(base);
        let gates = feature_gates(&config.feature_gates)?;
        Ok((config, gates))
    }

    /// Overlays the flags that were given onto `config`.
    pub fn apply(&self, mut config: ManagerConfig) -> ManagerConfig {
        if let Some(v) = &self.metrics_bind_addr {
            config.metrics_bind_addr = v.clone();
        }
        if let Some(v) = self.leader_elect {
            config.leader_elect = v;
        }
        if let Some(v) = &self.namespace {
            config.namespace = v.clone();
        }
        if let Some(v) = &self.profiler_address {
            config.profiler_address = (!v.is_empty()).then(|| v.clone());
        }
        if let Some(v) = self.ekscontrolplane_concurrency {
            config.ekscontrolplane_concurrency = v;
        }
        if let Some(v) = self.sync_period {
            config.sync_period = v;
        }
        if let Some(v) = self.webhook_port {
            config.webhook_port = v;
        }
        if let Some(v) = &self.webhook_cert_dir {
            config.webhook_cert_dir = v.clone();
        }
        if let Some(v) = &self.service_endpoints {
            config.service_endpoints = v.clone();
        }
        if let Some(v) = &self.watch_filter {
            config.watch_filter_value = v.clone();
        }
        if let Some(v) = &self.feature_gates {
            config.feature_gates = v.clone();
        }
        if let Some(v) = &self.health_addr {
            config.health_addr = v.clone();
        }
        if let Some(v) = &self.kubeconfig {
            config.kubeconfig = Some(v.clone());
        }
        if let Some(v) = &self.leader_election_lock_dir {
            config.leader_election_lock_dir = v.clone();
        }
        if let Some(v) = self.shutdown_timeout {
            config.shutdown_timeout = v;
        }
        config
    }
}

/// Applies `Name=bool,...` overrides to the default gates.
pub fn feature_gates(overrides: &str) -> Result<FeatureGateSet, ConfigError> {
    let mut gates = capa::default_gate_set();
    gates
        .set_from_string(overrides)
        .map_err(|source| ConfigError::FeatureGates {
            value: overrides.to_string(),
            source,
        })?;
    Ok(gates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("eks-controlplane-manager").chain(args.iter().copied()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_defaults() {
        let (config, gates) = parse(&[]).resolve().await.unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert!(!gates.enabled(capa::EKS_ENABLE_IAM));
        assert!(!gates.enabled(capa::EKS_ALLOW_ADD_ROLES));
    }

    #[tokio::test]
    async fn test_flags_round_trip() {
        let options = parse(&[
            "--metrics-bind-addr=127.0.0.1:8081",
            "--leader-elect",
            "--namespace=capa-system",
            "--profiler-address=localhost:6060",
            "--ekscontrolplane-concurrency=4",
            "--sync-period=5m",
            "--webhook-port=10443",
            "--webhook-cert-dir=/etc/certs",
            "--service-endpoints=us-east-1:iam=https://iam.example",
            "--watch-filter=team-a",
            "--feature-gates=EKSEnableIAM=true",
            "--health-addr=:9441",
            "--shutdown-timeout=45s",
        ]);
        let (config, gates) = options.resolve().await.unwrap();

        assert_eq!(config.metrics_bind_addr, "127.0.0.1:8081");
        assert!(config.leader_elect);
        assert_eq!(config.namespace, "capa-system");
        assert_eq!(config.profiler_address.as_deref(), Some("localhost:6060"));
        assert_eq!(config.ekscontrolplane_concurrency, 4);
        assert_eq!(config.sync_period, Duration::from_secs(300));
        assert_eq!(config.webhook_port, 10443);
        assert_eq!(config.webhook_cert_dir, PathBuf::from("/etc/certs"));
        assert_eq!(config.service_endpoints, "us-east-1:iam=https://iam.example");
        assert_eq!(config.watch_filter_value, "team-a");
        assert_eq!(config.health_addr, ":9441");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(45));
        assert!(gates.enabled(capa::EKS_ENABLE_IAM));
    }

    #[tokio::test]
    async fn test_leader_elect_accepts_explicit_value() {
        let (config, _) = parse(&["--leader-elect=false"]).resolve().await.unwrap();
        assert!(!config.leader_elect);
    }

    #[tokio::test]
    async fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(
            &path,
            "namespace: from-file\nsyncPeriod: 2m\nekscontrolplaneConcurrency: 3\n",
        )
        .await
        .unwrap();

        let options = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--namespace=from-flag",
        ]);
        let (config, _) = options.resolve().await.unwrap();
        assert_eq!(config.namespace, "from-flag");
        assert_eq!(config.sync_period, Duration::from_secs(120));
        assert_eq!(config.ekscontrolplane_concurrency, 3);
    }

    #[tokio::test]
    async fn test_invalid_feature_gates() {
        let err = parse(&["--feature-gates=NoSuchGate=true"])
            .resolve()
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::FeatureGates { .. }));
    }

    #[test]
    fn test_invalid_duration_rejected_by_parser() {
        assert!(Options::try_parse_from(["eks-controlplane-manager", "--sync-period=soon"]).is_err());
    }
}
