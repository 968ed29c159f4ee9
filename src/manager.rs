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

//! Controller manager - owns every registration and the blocking run loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{BindAddress, ConfigError, ManagerConfig};
use crate::controller::ReconcilerError;
use crate::controller_context::ReconcilerContext;
use crate::health::{HealthChecker, HealthError, HealthRegistry, HealthServer};
use crate::leader_election::{
    create_identity, LeaderElection, LeaderElectionConfig, LeaderElectionError,
    LockFileLeaderElection,
};
use crate::profiler::Profiler;
use crate::record::{EventBroadcaster, EventRecorder, KubeEventSink, LogSink};
use crate::registry::{
    ReconcilerRegistration, ReconcilerRegistry, RegistrationError, WebhookRegistration,
    WebhookRegistry,
};
use crate::scheme::{kind_string, Scheme};
use crate::webhook::{WebhookError, WebhookServer};

/// Leader election identifier of this operator.
pub const LEADER_ELECTION_ID: &str = "eks-controlplane-manager-leader-elect-capa";

/// Errors constructing or running a manager.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("leader election is enabled but no election id was given")]
    MissingLeaderElectionId,

    #[error(transparent)]
    LeaderElection(#[from] LeaderElectionError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Reconciler(#[from] ReconcilerError),

    #[error("controller task panicked: {0}")]
    ControllerPanicked(String),

    #[error("manager is already running")]
    AlreadyStarted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Everything needed to build a manager.
#[derive(Clone)]
pub struct ManagerOptions {
    /// Kinds the manager may watch and admit.
    pub scheme: Arc<Scheme>,

    /// Metrics endpoint, `None` when disabled.
    pub metrics_bind_address: Option<BindAddress>,

    /// Whether to run controllers only while holding the leader lease.
    pub leader_election: bool,

    /// Identifier shared by all candidates of this operator.
    pub leader_election_id: String,

    /// Directory of the leader election lock.
    pub leader_election_lock_dir: PathBuf,

    /// Maximum interval between reconciliations of an unchanged object.
    pub sync_period: Duration,

    /// Namespace to watch, `None` for all.
    pub namespace: Option<String>,

    /// Shared event queue.
    pub event_broadcaster: EventBroadcaster,

    /// Directory holding `tls.crt` and `tls.key`.
    pub cert_dir: PathBuf,

    /// Admission server port.
    pub port: u16,

    /// Probe endpoint, `None` when disabled.
    pub health_probe_bind_address: Option<BindAddress>,

    /// Diagnostics endpoint, `None` when disabled.
    pub profiler_address: Option<BindAddress>,

    /// Time allowed for controllers to drain on shutdown.
    pub shutdown_timeout: Duration,

    /// Kubernetes client, absent when running without a cluster.
    pub client: Option<Client>,
}

impl ManagerOptions {
    /// Builds options from the resolved configuration.
    pub fn from_config(
        config: &ManagerConfig,
        scheme: Arc<Scheme>,
        event_broadcaster: EventBroadcaster,
        client: Option<Client>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            scheme,
            metrics_bind_address: config.metrics_address()?,
            leader_election: config.leader_elect,
            leader_election_id: LEADER_ELECTION_ID.to_string(),
            leader_election_lock_dir: config.leader_election_lock_dir.clone(),
            sync_period: config.sync_period,
            namespace: (!config.namespace.is_empty()).then(|| config.namespace.clone()),
            event_broadcaster,
            cert_dir: config.webhook_cert_dir.clone(),
            port: config.webhook_port,
            health_probe_bind_address: config.health_address()?,
            profiler_address: config.profiler_bind_address()?,
            shutdown_timeout: config.shutdown_timeout,
            client,
        })
    }
}

impl std::fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("scheme_kinds", &self.scheme.len())
            .field("metrics_bind_address", &self.metrics_bind_address)
            .field("leader_election", &self.leader_election)
            .field("leader_election_id", &self.leader_election_id)
            .field("sync_period", &self.sync_period)
            .field("namespace", &self.namespace)
            .field("cert_dir", &self.cert_dir)
            .field("port", &self.port)
            .field("health_probe_bind_address", &self.health_probe_bind_address)
            .field("profiler_address", &self.profiler_address)
            .field("has_client", &self.client.is_some())
            .finish()
    }
}

/// The single owning context for all registrations.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Returns a recorder that stamps events with `name`.
    fn event_recorder_for(&self, name: &str) -> EventRecorder;

    /// Adds a liveness check served under `/healthz`.
    async fn add_healthz_check(
        &mut self,
        name: &str,
        check: Arc<dyn HealthChecker>,
    ) -> Result<(), ManagerError>;

    /// Adds a readiness check served under `/readyz`.
    async fn add_readyz_check(
        &mut self,
        name: &str,
        check: Arc<dyn HealthChecker>,
    ) -> Result<(), ManagerError>;

    /// Binds a reconciler.
    fn add_reconciler(&mut self, registration: ReconcilerRegistration) -> Result<(), RegistrationError>;

    /// Binds an admission webhook.
    fn add_webhook(&mut self, registration: WebhookRegistration) -> Result<(), RegistrationError>;

    /// Runs until `cancel` fires or a fatal error occurs.
    async fn run(&self, cancel: CancellationToken) -> Result<(), ManagerError>;
}

/// Builds managers. Tests substitute fakes.
#[async_trait]
pub trait ManagerFactory: Send + Sync {
    async fn construct(&self, options: ManagerOptions) -> Result<Box<dyn Manager>, ManagerError>;
}

/// Builds [`ControllerManager`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControllerManagerFactory;

#[async_trait]
impl ManagerFactory for ControllerManagerFactory {
    async fn construct(&self, options: ManagerOptions) -> Result<Box<dyn Manager>, ManagerError> {
        Ok(Box::new(ControllerManager::new(options).await?))
    }
}

type ControllerResult = (String, Result<(), ReconcilerError>);

/// The in-tree manager.
///
/// Run order:
/// 1. start event delivery
/// 2. start probe, profiler and webhook servers
/// 3. wait for leadership, when enabled
/// 4. start controllers in registration order
pub struct ControllerManager {
    options: ManagerOptions,
    healthz: HealthRegistry,
    readyz: HealthRegistry,
    reconcilers: ReconcilerRegistry,
    webhooks: WebhookRegistry,
    webhook_server: WebhookServer,
    leader_election: Option<Arc<dyn LeaderElection>>,
    started: AtomicBool,
}

impl ControllerManager {
    /// Creates a manager. Fails when leader election cannot be prepared.
    pub async fn new(options: ManagerOptions) -> Result<Self, ManagerError> {
        let leader_election: Option<Arc<dyn LeaderElection>> = if options.leader_election {
            if options.leader_election_id.is_empty() {
                return Err(ManagerError::MissingLeaderElectionId);
            }
            tokio::fs::create_dir_all(&options.leader_election_lock_dir)
                .await
                .map_err(|source| LeaderElectionError::Io {
                    path: options.leader_election_lock_dir.clone(),
                    source,
                })?;
            let config = LeaderElectionConfig::new(
                &options.leader_election_lock_dir,
                &options.leader_election_id,
                create_identity(),
            );
            Some(Arc::new(LockFileLeaderElection::new(config)))
        } else {
            None
        };

        options.event_broadcaster.add_sink(Arc::new(LogSink));
        if let Some(client) = &options.client {
            options
                .event_broadcaster
                .add_sink(Arc::new(KubeEventSink::new(client.clone())));
        }

        if let Some(address) = &options.metrics_bind_address {
            tracing::debug!(address = %address, "metrics endpoint is configured but not served");
        }

        Ok(Self {
            options,
            healthz: HealthRegistry::new(),
            readyz: HealthRegistry::new(),
            reconcilers: ReconcilerRegistry::new(),
            webhooks: WebhookRegistry::new(),
            webhook_server: WebhookServer::new(),
            leader_election,
            started: AtomicBool::new(false),
        })
    }

    /// Replaces the leader election backend.
    pub fn with_leader_election(mut self, election: Arc<dyn LeaderElection>) -> Self {
        self.leader_election = Some(election);
        self
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn reconcilers(&self) -> &ReconcilerRegistry {
        &self.reconcilers
    }

    pub fn webhooks(&self) -> &WebhookRegistry {
        &self.webhooks
    }

    /// Paths bound on the admission server.
    pub fn webhook_paths(&self) -> Vec<&str> {
        self.webhook_server.paths()
    }

    fn check_scheme(&self, gvk: &crate::scheme::GroupVersionKind) -> Result<(), RegistrationError> {
        if !self.options.scheme.recognizes(gvk) {
            return Err(RegistrationError::UnknownKind(kind_string(gvk)));
        }
        Ok(())
    }

    async fn start_servers(
        &self,
        stop: &CancellationToken,
        servers: &mut JoinSet<Result<(), ManagerError>>,
    ) -> Result<(), ManagerError> {
        if let Some(address) = &self.options.health_probe_bind_address {
            let server = HealthServer::new(address.clone(), self.healthz.clone(), self.readyz.clone());
            let listener = server.bind().await?;
            let stop = stop.clone();
            servers.spawn(async move { server.serve(listener, stop).await.map_err(ManagerError::from) });
        }

        if let Some(address) = &self.options.profiler_address {
            Profiler::new(address.clone()).spawn(stop.clone());
        }

        if !self.webhook_server.is_empty() {
            let server = self.webhook_server.clone();
            let port = self.options.port;
            let cert_dir = self.options.cert_dir.clone();
            let stop = stop.clone();
            servers.spawn(async move {
                server
                    .serve(port, &cert_dir, stop)
                    .await
                    .map_err(ManagerError::from)
            });
        }
        Ok(())
    }

    fn start_controllers(&self, stop: &CancellationToken, controllers: &mut JoinSet<ControllerResult>) {
        for registration in self.reconcilers.iter() {
            let reconciler = registration.reconciler().clone();
            let ctx = ReconcilerContext::new(
                registration.kind(),
                registration.max_concurrent_reconciles(),
                registration.watch_filter().clone(),
                self.options.namespace.clone(),
                registration.flags().clone(),
                self.options.sync_period,
                self.options.client.clone(),
            );
            let cancel = stop.child_token();

            controllers.spawn(async move {
                let name = reconciler.name().to_string();
                tracing::info!(
                    controller = %name,
                    worker_count = ctx.max_concurrent_reconciles,
                    "starting controller"
                );

                let result = reconciler.run(ctx, cancel).await;
                match &result {
                    Ok(()) => tracing::info!(controller = %name, "controller stopped"),
                    Err(e) => tracing::error!(controller = %name, error = %e, "controller terminated with error"),
                }
                (name, result)
            });
        }
    }

    /// Blocks until cancelled or until a controller or server fails.
    async fn wait(
        &self,
        cancel: &CancellationToken,
        servers: &mut JoinSet<Result<(), ManagerError>>,
        controllers: &mut JoinSet<ControllerResult>,
    ) -> Result<(), ManagerError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown signal received, waiting for controllers to stop");
                    return Ok(());
                }
                Some(joined) = controllers.join_next() => match joined {
                    Ok((name, Ok(()))) => {
                        tracing::debug!(controller = %name, "controller finished");
                    }
                    Ok((_, Err(e))) => return Err(e.into()),
                    Err(e) => return Err(ManagerError::ControllerPanicked(e.to_string())),
                },
                Some(joined) = servers.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(anyhow::anyhow!("manager task failed: {}", e).into()),
                },
            }
        }
    }

    async fn run_until_stopped(
        &self,
        cancel: &CancellationToken,
        stop: &CancellationToken,
        servers: &mut JoinSet<Result<(), ManagerError>>,
        controllers: &mut JoinSet<ControllerResult>,
    ) -> Result<(), ManagerError> {
        self.start_servers(stop, servers).await?;

        if let Some(election) = &self.leader_election {
            let acquired = tokio::select! {
                acquired = election.acquire(cancel) => acquired?,
                Some(joined) = servers.join_next() => match joined {
                    Ok(Ok(())) => false,
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(anyhow::anyhow!("manager task failed: {}", e).into()),
                },
            };
            if !acquired {
                tracing::info!("stopped before acquiring leadership");
                return Ok(());
            }

            let election = election.clone();
            let stop = stop.clone();
            servers.spawn(async move { election.hold(&stop).await.map_err(ManagerError::from) });
        }

        self.start_controllers(stop, controllers);
        self.wait(cancel, servers, controllers).await
    }

    async fn drain(&self, servers: &mut JoinSet<Result<(), ManagerError>>, controllers: &mut JoinSet<ControllerResult>) {
        let deadline = tokio::time::Instant::now() + self.options.shutdown_timeout;

        while !controllers.is_empty() {
            match tokio::time::timeout_at(deadline, controllers.join_next()).await {
                Ok(Some(Ok((name, Ok(()))))) => {
                    tracing::debug!(controller = %name, "controller stopped");
                }
                Ok(Some(Ok((name, Err(e))))) => {
                    tracing::warn!(controller = %name, error = %e, "controller stopped with error");
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, "controller task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        remaining = controllers.len(),
                        timeout = ?self.options.shutdown_timeout,
                        "shutdown timeout reached, controllers still running"
                    );
                    controllers.abort_all();
                    break;
                }
            }
        }

        while let Ok(Some(_)) = tokio::time::timeout_at(deadline, servers.join_next()).await {}
        servers.abort_all();
    }
}

#[async_trait]
impl Manager for ControllerManager {
    fn event_recorder_for(&self, name: &str) -> EventRecorder {
        self.options.event_broadcaster.recorder_for(name)
    }

    async fn add_healthz_check(
        &mut self,
        name: &str,
        check: Arc<dyn HealthChecker>,
    ) -> Result<(), ManagerError> {
        Ok(self.healthz.register(name, check).await?)
    }

    async fn add_readyz_check(
        &mut self,
        name: &str,
        check: Arc<dyn HealthChecker>,
    ) -> Result<(), ManagerError> {
        Ok(self.readyz.register(name, check).await?)
    }

    fn add_reconciler(&mut self, registration: ReconcilerRegistration) -> Result<(), RegistrationError> {
        self.check_scheme(&registration.kind())?;
        self.reconcilers.register(registration)
    }

    fn add_webhook(&mut self, registration: WebhookRegistration) -> Result<(), RegistrationError> {
        let kind = registration.kind();
        self.check_scheme(&kind)?;
        if self.webhooks.contains(&kind) {
            return Err(RegistrationError::DuplicateKind(kind_string(&kind)));
        }
        self.webhook_server.register(registration.webhook().clone())?;
        self.webhooks.register(registration)?;
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), ManagerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        tracing::info!(
            controllers = self.reconcilers.len(),
            webhooks = self.webhooks.len(),
            "starting manager"
        );

        // Event delivery outlives the controllers so their last events flush.
        let events = CancellationToken::new();
        let delivery = self.options.event_broadcaster.start(events.clone());

        let stop = cancel.child_token();
        let mut servers = JoinSet::new();
        let mut controllers = JoinSet::new();

        let result = self
            .run_until_stopped(&cancel, &stop, &mut servers, &mut controllers)
            .await;

        stop.cancel();
        self.drain(&mut servers, &mut controllers).await;
        if let Some(election) = &self.leader_election {
            election.release().await;
        }

        events.cancel();
        if let Some(delivery) = delivery {
            let _ = delivery.await;
        }

        match &result {
            Ok(()) => tracing::info!("manager stopped"),
            Err(e) => tracing::error!(error = %e, "manager stopped with error"),
        }
        result
    }
}
