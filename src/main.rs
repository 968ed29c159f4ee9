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

//! eks-controlplane-manager - runs the EKS control plane controllers and
//! admission webhooks.

#![warn(clippy::all)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use eks_controlplane_manager::config::ManagerConfig;
use eks_controlplane_manager::controlplane::EksControlPlane;
use eks_controlplane_manager::manager::ControllerManagerFactory;
use eks_controlplane_manager::lifecycle::ClientProvider;
use eks_controlplane_manager::{record, scheme, ManagerLifecycle, Options, StartupError};

#[tokio::main]
async fn main() -> ExitCode {
    let options = Options::parse();

    init_logging(&options.log_level, options.log_json);

    info!(version = eks_controlplane_manager::VERSION, "starting eks-controlplane-manager");

    match run(options).await {
        Ok(()) => {
            info!("eks-controlplane-manager exited successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(stage = e.stage(), error = %e, "eks-controlplane-manager failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(options: Options) -> Result<(), StartupError> {
    let (config, feature_gates) = options.resolve().await?;
    info!(feature_gates = %feature_gates, "resolved feature gates");

    let mut lifecycle = ManagerLifecycle::new(
        Arc::new(ControllerManagerFactory),
        Arc::new(EksControlPlane),
        record::global(),
        Arc::new(scheme::default_scheme()),
    )
    .with_client_provider(Arc::new(KubeClientProvider));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown().await;
            cancel.cancel();
        }
    });

    lifecycle.start(config, feature_gates, cancel).await
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|e| {
            eprintln!("invalid --log-level {:?}: {}, falling back to info", level, e);
            EnvFilter::new("info")
        });

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

/// User agent sent with every API request.
const USER_AGENT: &str = "cluster-api-provider-aws-controller";

/// Loads the client from `--kubeconfig` or the in-cluster environment.
struct KubeClientProvider;

#[async_trait]
impl ClientProvider for KubeClientProvider {
    async fn client(&self, config: &ManagerConfig) -> anyhow::Result<kube::Client> {
        create_client(config).await
    }
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &ManagerConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let mut kube_config = if let Some(kubeconfig_path) = &config.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else {
        Config::infer().await.context("failed to infer cluster configuration")?
    };

    set_user_agent(&mut kube_config);
    kube::Client::try_from(kube_config).context("failed to create Kubernetes client")
}

fn set_user_agent(config: &mut kube::Config) {
    use hyper::http::header::{HeaderValue, USER_AGENT as USER_AGENT_HEADER};

    config.headers.retain(|(name, _)| *name != USER_AGENT_HEADER);
    config
        .headers
        .push((USER_AGENT_HEADER, HeaderValue::from_static(USER_AGENT)));
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let (mut sigterm, mut sigint) = match (
            signal::unix::signal(signal::unix::SignalKind::terminate()),
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to install signal handlers, falling back to ctrl-c");
                let _ = signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("received Ctrl+C, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_is_set_once() {
        let mut config = kube::Config::new("https://127.0.0.1:6443".parse().unwrap());
        set_user_agent(&mut config);
        set_user_agent(&mut config);

        let agents: Vec<_> = config
            .headers
            .iter()
            .filter(|(name, _)| *name == hyper::http::header::USER_AGENT)
            .map(|(_, value)| value.to_str().unwrap())
            .collect();
        assert_eq!(agents, vec![USER_AGENT]);
    }
}
