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

//! Pre-flight checks run before any controller is started.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ManagerConfig;
use crate::endpoints::{self, ParseError, ServiceEndpointMap};
use crate::feature::{capa, FeatureGateSet, InvalidFeatureGateCombination};

/// Largest sync period allowed for EKS control planes.
pub const MAX_EKS_SYNC_PERIOD: Duration = Duration::from_secs(10 * 60);

/// A rule rejected the resolved configuration.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error(
        "sync period greater than maximum allowed: {} > {}",
        fmt_duration(.period),
        fmt_duration(.max)
    )]
    SyncPeriodExceeded { period: Duration, max: Duration },

    #[error("unable to parse service endpoints: {0}")]
    EndpointParse(#[from] ParseError),

    #[error(transparent)]
    InvalidFeatureGateCombination(#[from] InvalidFeatureGateCombination),
}

impl GuardError {
    /// Short name of the rule that failed.
    pub fn rule(&self) -> &'static str {
        match self {
            GuardError::SyncPeriodExceeded { .. } => "sync-period",
            GuardError::EndpointParse(_) => "service-endpoints",
            GuardError::InvalidFeatureGateCombination(_) => "feature-gates",
        }
    }
}

fn fmt_duration(d: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*d)
}

/// Configuration that passed every guard rule.
#[derive(Debug, Clone)]
pub struct ValidatedConfiguration {
    /// The resolved configuration.
    pub config: Arc<ManagerConfig>,
    /// Parsed `--service-endpoints`.
    pub endpoints: Arc<ServiceEndpointMap>,
    /// Feature gates after overrides.
    pub feature_gates: Arc<FeatureGateSet>,
    /// Whether IAM roles are created for control planes.
    pub enable_iam: bool,
    /// Whether additional roles may be attached.
    pub allow_add_roles: bool,
}

/// Runs the guard rules in order and stops at the first failure.
///
/// 1. sync period ceiling
/// 2. service endpoint grammar
/// 3. feature gate dependencies
pub fn validate(
    config: ManagerConfig,
    feature_gates: FeatureGateSet,
) -> Result<ValidatedConfiguration, GuardError> {
    check_sync_period(config.sync_period)?;

    let endpoints = endpoints::parse(&config.service_endpoints)?;

    let enable_iam = feature_gates.enabled(capa::EKS_ENABLE_IAM);
    let allow_add_roles = feature_gates.enabled(capa::EKS_ALLOW_ADD_ROLES);
    tracing::info!(enabled = enable_iam, "EKS IAM role creation");
    tracing::info!(enabled = allow_add_roles, "EKS IAM additional roles");

    feature_gates.validate(capa::DEPENDENCIES)?;

    Ok(ValidatedConfiguration {
        config: Arc::new(config),
        endpoints: Arc::new(endpoints),
        feature_gates: Arc::new(feature_gates),
        enable_iam,
        allow_add_roles,
    })
}

/// Rejects sync periods above [`MAX_EKS_SYNC_PERIOD`].
pub fn check_sync_period(period: Duration) -> Result<(), GuardError> {
    if period > MAX_EKS_SYNC_PERIOD {
        return Err(GuardError::SyncPeriodExceeded {
            period,
            max: MAX_EKS_SYNC_PERIOD,
        });
    }
    Ok(())
}
