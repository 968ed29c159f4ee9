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

//! Startup error taxonomy.

use thiserror::Error;

use crate::config::ConfigError;
use crate::guard::GuardError;
use crate::manager::ManagerError;
use crate::record::RecordError;
use crate::registry::RegistrationError;

/// Any failure that ends the process with a non-zero exit code.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("operational guard {} failed: {}", .0.rule(), .0)]
    Guard(#[from] GuardError),

    #[error("unable to create manager: {0}")]
    Construction(#[source] ManagerError),

    #[error("unable to initialize event recorder: {0}")]
    EventRecorder(#[from] RecordError),

    #[error("unable to create health check: {0}")]
    Probe(#[source] ManagerError),

    #[error("unable to create controller: {0}")]
    ReconcilerRegistration(#[source] RegistrationError),

    #[error("unable to create webhook: {0}")]
    WebhookRegistration(#[source] RegistrationError),

    #[error("problem running manager: {0}")]
    Run(#[source] ManagerError),
}

impl StartupError {
    /// Name of the startup stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            StartupError::Configuration(_) => "configuration",
            StartupError::Guard(_) => "guard",
            StartupError::Construction(_) => "construction",
            StartupError::EventRecorder(_) => "event-recorder",
            StartupError::Probe(_) => "probe",
            StartupError::ReconcilerRegistration(_) => "reconciler-registration",
            StartupError::WebhookRegistration(_) => "webhook-registration",
            StartupError::Run(_) => "run",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::guard::check_sync_period;

    #[test]
    fn test_guard_error_names_rule() {
        let err: StartupError = check_sync_period(Duration::from_secs(3600)).unwrap_err().into();
        assert_eq!(err.stage(), "guard");
        let message = err.to_string();
        assert!(message.starts_with("operational guard sync-period failed"));
        assert!(message.contains("1h"));
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(
            StartupError::from(ConfigError::InvalidWebhookPort).stage(),
            "configuration"
        );
        assert_eq!(
            StartupError::Run(ManagerError::AlreadyStarted).stage(),
            "run"
        );
        assert_eq!(
            StartupError::ReconcilerRegistration(RegistrationError::DuplicateKind("x".into())).stage(),
            "reconciler-registration"
        );
    }
}
