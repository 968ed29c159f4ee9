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

//! Registrations for the `AWSManagedControlPlane` kind.

use std::sync::Arc;

use async_trait::async_trait;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use tokio_util::sync::CancellationToken;

use crate::controller::{self, Reconciler};
use crate::controller_context::ReconcilerContext;
use crate::endpoints::ServiceEndpointMap;
use crate::guard::ValidatedConfiguration;
use crate::lifecycle::Collaborators;
use crate::record::EventRecorderFacade;
use crate::registry::{ReconcilerRegistration, WebhookRegistration};
use crate::scheme::{GroupVersionKind, CONTROLPLANE_GROUP};
use crate::webhook::AdmissionWebhook;

/// Registration flag: create IAM roles for control planes.
pub const FLAG_ENABLE_IAM: &str = "EnableIAM";

/// Registration flag: allow additional roles on control planes.
pub const FLAG_ALLOW_ADDITIONAL_ROLES: &str = "AllowAdditionalRoles";

/// Version served by the controller and webhook.
pub const CONTROLPLANE_VERSION: &str = "v1alpha4";

/// `AWSManagedControlPlane` kind of the served version.
pub fn aws_managed_control_plane_kind() -> GroupVersionKind {
    GroupVersionKind::gvk(CONTROLPLANE_GROUP, CONTROLPLANE_VERSION, "AWSManagedControlPlane")
}

/// Controller handle for `AWSManagedControlPlane`.
pub struct AwsManagedControlPlaneReconciler {
    endpoints: Arc<ServiceEndpointMap>,
    events: Arc<EventRecorderFacade>,
}

impl AwsManagedControlPlaneReconciler {
    pub fn new(endpoints: Arc<ServiceEndpointMap>, events: Arc<EventRecorderFacade>) -> Self {
        Self { endpoints, events }
    }

    pub fn endpoints(&self) -> &ServiceEndpointMap {
        &self.endpoints
    }
}

#[async_trait]
impl Reconciler for AwsManagedControlPlaneReconciler {
    fn name(&self) -> &str {
        "awsmanagedcontrolplane"
    }

    fn kind(&self) -> GroupVersionKind {
        aws_managed_control_plane_kind()
    }

    async fn run(&self, ctx: ReconcilerContext, cancel: CancellationToken) -> controller::Result<()> {
        tracing::info!(
            controller = self.name(),
            enable_iam = ctx.flag(FLAG_ENABLE_IAM),
            allow_additional_roles = ctx.flag(FLAG_ALLOW_ADDITIONAL_ROLES),
            endpoint_overrides = self.endpoints.len(),
            watch_filter = ctx.watch_filter.value(),
            namespace = ctx.namespace.as_deref().unwrap_or(""),
            resync_period = ?ctx.resync_period(),
            events_ready = self.events.is_initialized(),
            "control plane controller started"
        );

        // TODO: drive AWSManagedControlPlane objects through the EKS service
        // client once it lands; until then the controller only holds its slot.
        cancel.cancelled().await;
        Ok(())
    }
}

/// Admission handle for `AWSManagedControlPlane`. Admits every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AwsManagedControlPlaneWebhook;

#[async_trait]
impl AdmissionWebhook for AwsManagedControlPlaneWebhook {
    fn kind(&self) -> GroupVersionKind {
        aws_managed_control_plane_kind()
    }

    async fn mutate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        AdmissionResponse::from(request)
    }

    async fn validate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        tracing::debug!(name = %request.name, operation = ?request.operation, "admitting control plane");
        AdmissionResponse::from(request)
    }
}

/// The collaborators bound by the EKS control plane manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct EksControlPlane;

impl Collaborators for EksControlPlane {
    fn reconcilers(
        &self,
        config: &ValidatedConfiguration,
        events: &Arc<EventRecorderFacade>,
    ) -> Vec<ReconcilerRegistration> {
        let reconciler = AwsManagedControlPlaneReconciler::new(config.endpoints.clone(), events.clone());
        vec![ReconcilerRegistration::builder(Arc::new(reconciler))
            .max_concurrent_reconciles(config.config.ekscontrolplane_concurrency)
            .watch_filter(config.config.watch_filter_value.clone())
            .flag(FLAG_ENABLE_IAM, config.enable_iam)
            .flag(FLAG_ALLOW_ADDITIONAL_ROLES, config.allow_add_roles)
            .build()]
    }

    fn webhooks(&self, _config: &ValidatedConfiguration) -> Vec<WebhookRegistration> {
        vec![WebhookRegistration::new(Arc::new(AwsManagedControlPlaneWebhook))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::feature::capa;
    use crate::guard;
    use crate::scheme::default_scheme;

    #[test]
    fn test_registrations_follow_configuration() {
        let mut gates = capa::default_gate_set();
        gates.set(capa::EKS_ENABLE_IAM, true).unwrap();
        let config = ManagerConfig {
            ekscontrolplane_concurrency: 7,
            watch_filter_value: "team-a".to_string(),
            ..Default::default()
        };
        let validated = guard::validate(config, gates).unwrap();
        let events = Arc::new(EventRecorderFacade::new());

        let reconcilers = EksControlPlane.reconcilers(&validated, &events);
        assert_eq!(reconcilers.len(), 1);
        let registration = &reconcilers[0];
        assert_eq!(registration.max_concurrent_reconciles(), 7);
        assert_eq!(registration.watch_filter().value(), "team-a");
        assert_eq!(registration.flags().get(FLAG_ENABLE_IAM), Some(&true));
        assert_eq!(registration.flags().get(FLAG_ALLOW_ADDITIONAL_ROLES), Some(&false));

        let webhooks = EksControlPlane.webhooks(&validated);
        assert_eq!(webhooks.len(), 1);
    }

    #[test]
    fn test_served_kind_is_in_default_scheme() {
        assert!(default_scheme().recognizes(&aws_managed_control_plane_kind()));
    }
}
