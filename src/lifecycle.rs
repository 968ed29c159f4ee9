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

//! Manager lifecycle - the single long-running process loop.
//!
//! Startup runs these stages in order and stops at the first failure:
//! 1. validate the configuration and run the operational guards
//! 2. construct the manager around a burst-tolerant event broadcaster
//! 3. install the process-wide event recorder
//! 4. register the `ping` liveness and readiness checks
//! 5. register every reconciler and webhook
//! 6. block on the manager's run loop

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::error::StartupError;
use crate::feature::FeatureGateSet;
use crate::guard::{self, ValidatedConfiguration};
use crate::health::Ping;
use crate::manager::{ManagerFactory, ManagerOptions};
use crate::record::{EventBroadcaster, EventRecorderFacade, EVENT_BURST_SIZE};
use crate::registry::{ReconcilerRegistration, WebhookRegistration};
use crate::scheme::Scheme;

/// Name under which collaborators emit events.
pub const EVENT_SOURCE: &str = "aws-controller";

/// Name of the trivial liveness and readiness checks.
pub const PING_CHECK: &str = "ping";

/// Lifecycle states. Transitions only move forward, and `Failed` is
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Unconfigured,
    Validated,
    Constructed,
    Registered,
    Running,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// Returns true for `Stopped` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }

    fn next(self) -> Option<LifecycleState> {
        match self {
            LifecycleState::Unconfigured => Some(LifecycleState::Validated),
            LifecycleState::Validated => Some(LifecycleState::Constructed),
            LifecycleState::Constructed => Some(LifecycleState::Registered),
            LifecycleState::Registered => Some(LifecycleState::Running),
            LifecycleState::Running => Some(LifecycleState::Stopped),
            LifecycleState::Stopped | LifecycleState::Failed => None,
        }
    }

    /// Returns true if `self -> to` is allowed.
    pub fn can_transition_to(self, to: LifecycleState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == LifecycleState::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Validated => "validated",
            LifecycleState::Constructed => "constructed",
            LifecycleState::Registered => "registered",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Supplies the reconcilers and webhooks bound at startup.
pub trait Collaborators: Send + Sync {
    /// Reconcilers to bind, in start order.
    fn reconcilers(
        &self,
        config: &ValidatedConfiguration,
        events: &Arc<EventRecorderFacade>,
    ) -> Vec<ReconcilerRegistration>;

    /// Webhooks to bind.
    fn webhooks(&self, config: &ValidatedConfiguration) -> Vec<WebhookRegistration>;
}

/// Opens the Kubernetes client once the configuration has passed the guards.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn client(&self, config: &ManagerConfig) -> anyhow::Result<Client>;
}

/// Owns manager construction, registration and the blocking run loop.
pub struct ManagerLifecycle {
    factory: Arc<dyn ManagerFactory>,
    collaborators: Arc<dyn Collaborators>,
    events: Arc<EventRecorderFacade>,
    scheme: Arc<Scheme>,
    client: Option<Client>,
    client_provider: Option<Arc<dyn ClientProvider>>,
    state: LifecycleState,
    transitions: Vec<(LifecycleState, LifecycleState)>,
    validated: Option<ValidatedConfiguration>,
}

impl ManagerLifecycle {
    pub fn new(
        factory: Arc<dyn ManagerFactory>,
        collaborators: Arc<dyn Collaborators>,
        events: Arc<EventRecorderFacade>,
        scheme: Arc<Scheme>,
    ) -> Self {
        Self {
            factory,
            collaborators,
            events,
            scheme,
            client: None,
            client_provider: None,
            state: LifecycleState::Unconfigured,
            transitions: Vec::new(),
            validated: None,
        }
    }

    /// Sets the client handed to the manager.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Sets where the client comes from when none was given up front. The
    /// provider is only consulted after validation succeeded. Without a
    /// client the manager runs with log-only event delivery.
    pub fn with_client_provider(mut self, provider: Arc<dyn ClientProvider>) -> Self {
        self.client_provider = Some(provider);
        self
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every transition taken so far, oldest first.
    pub fn transitions(&self) -> &[(LifecycleState, LifecycleState)] {
        &self.transitions
    }

    /// The configuration that passed the guards, once validated.
    pub fn validated(&self) -> Option<&ValidatedConfiguration> {
        self.validated.as_ref()
    }

    /// Runs every startup stage, then blocks until `cancel` fires or the
    /// manager fails. Returns once the lifecycle reaches a terminal state.
    pub async fn start(
        &mut self,
        config: ManagerConfig,
        feature_gates: FeatureGateSet,
        cancel: CancellationToken,
    ) -> Result<(), StartupError> {
        match self.run_stages(config, feature_gates, cancel).await {
            Ok(()) => {
                self.transition(LifecycleState::Stopped);
                Ok(())
            }
            Err(e) => {
                self.transition(LifecycleState::Failed);
                Err(e)
            }
        }
    }

    async fn run_stages(
        &mut self,
        config: ManagerConfig,
        feature_gates: FeatureGateSet,
        cancel: CancellationToken,
    ) -> Result<(), StartupError> {
        config.validate()?;
        let validated = guard::validate(config, feature_gates)?;
        for endpoint in validated.endpoints.iter() {
            tracing::info!(endpoint = %endpoint, "using service endpoint override");
        }
        if !validated.config.namespace.is_empty() {
            tracing::info!(
                namespace = %validated.config.namespace,
                "Watching cluster-api objects only in namespace for reconciliation"
            );
        }
        self.validated = Some(validated.clone());
        self.transition(LifecycleState::Validated);

        if self.client.is_none() {
            if let Some(provider) = &self.client_provider {
                match provider.client(&validated.config).await {
                    Ok(client) => self.client = Some(client),
                    Err(e) => tracing::warn!(error = %format!("{:#}", e), "running without a Kubernetes client"),
                }
            }
        }

        let broadcaster = EventBroadcaster::with_burst_size(EVENT_BURST_SIZE);
        let options = ManagerOptions::from_config(
            &validated.config,
            self.scheme.clone(),
            broadcaster,
            self.client.clone(),
        )?;
        let mut manager = self
            .factory
            .construct(options)
            .await
            .map_err(StartupError::Construction)?;
        self.transition(LifecycleState::Constructed);

        self.events
            .init_from_recorder(manager.event_recorder_for(EVENT_SOURCE))?;

        manager
            .add_readyz_check(PING_CHECK, Arc::new(Ping))
            .await
            .map_err(StartupError::Probe)?;
        manager
            .add_healthz_check(PING_CHECK, Arc::new(Ping))
            .await
            .map_err(StartupError::Probe)?;

        for registration in self.collaborators.reconcilers(&validated, &self.events) {
            let name = registration.reconciler().name().to_string();
            manager
                .add_reconciler(registration)
                .map_err(StartupError::ReconcilerRegistration)?;
            tracing::debug!(controller = %name, "controller registered");
        }
        for registration in self.collaborators.webhooks(&validated) {
            manager
                .add_webhook(registration)
                .map_err(StartupError::WebhookRegistration)?;
        }
        self.transition(LifecycleState::Registered);

        self.transition(LifecycleState::Running);
        tracing::info!("starting manager");
        manager.run(cancel).await.map_err(StartupError::Run)
    }

    fn transition(&mut self, to: LifecycleState) {
        let from = self.state;
        debug_assert!(from.can_transition_to(to), "invalid transition {} -> {}", from, to);
        tracing::debug!(from = %from, to = %to, "manager lifecycle transition");
        self.transitions.push((from, to));
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only_move_forward() {
        use LifecycleState::*;

        assert!(Unconfigured.can_transition_to(Validated));
        assert!(Registered.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(!Unconfigured.can_transition_to(Constructed));
        assert!(!Validated.can_transition_to(Unconfigured));
        assert!(!Registered.can_transition_to(Stopped));

        for state in [Unconfigured, Validated, Constructed, Registered, Running] {
            assert!(state.can_transition_to(Failed));
        }
        for state in [Stopped, Failed] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(Failed));
        }
    }
}
