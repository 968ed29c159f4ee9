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

//! Reconciler and webhook registrations.
//!
//! A registration binds a collaborator to the manager. Each resource kind
//! may be bound at most once per registry.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::controller::Reconciler;
use crate::controller_context::{InvalidWatchFilter, WatchFilter};
use crate::scheme::{kind_string, GroupVersionKind};
use crate::webhook::{AdmissionWebhook, WebhookError};

/// Default number of in-flight reconciliations per kind.
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 1;

/// Errors binding a collaborator to the manager.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("kind {0} is already registered")]
    DuplicateKind(String),

    #[error("kind {0} is not registered in the scheme")]
    UnknownKind(String),

    #[error("controller for {kind} needs a concurrency bound greater than zero")]
    InvalidConcurrency { kind: String },

    #[error(transparent)]
    InvalidWatchFilter(#[from] InvalidWatchFilter),

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

/// Binds a reconciler to the manager.
///
/// # Example
///
/// ```ignore
/// let registration = ReconcilerRegistration::builder(reconciler)
///     .max_concurrent_reconciles(10)
///     .watch_filter("team-a")
///     .flag("EnableIAM", true)
///     .build();
/// ```
#[derive(Clone)]
pub struct ReconcilerRegistration {
    reconciler: Arc<dyn Reconciler>,
    max_concurrent_reconciles: usize,
    watch_filter: WatchFilter,
    flags: BTreeMap<String, bool>,
}

impl ReconcilerRegistration {
    /// Starts a registration for `reconciler`.
    pub fn builder(reconciler: Arc<dyn Reconciler>) -> Builder {
        Builder {
            registration: ReconcilerRegistration {
                reconciler,
                max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
                watch_filter: WatchFilter::default(),
                flags: BTreeMap::new(),
            },
        }
    }

    pub fn reconciler(&self) -> &Arc<dyn Reconciler> {
        &self.reconciler
    }

    pub fn kind(&self) -> GroupVersionKind {
        self.reconciler.kind()
    }

    pub fn max_concurrent_reconciles(&self) -> usize {
        self.max_concurrent_reconciles
    }

    pub fn watch_filter(&self) -> &WatchFilter {
        &self.watch_filter
    }

    pub fn flags(&self) -> &BTreeMap<String, bool> {
        &self.flags
    }

    /// Checks the concurrency bound and the watch predicate.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.max_concurrent_reconciles == 0 {
            return Err(RegistrationError::InvalidConcurrency {
                kind: kind_string(&self.kind()),
            });
        }
        self.watch_filter.validate()?;
        Ok(())
    }
}

impl fmt::Debug for ReconcilerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerRegistration")
            .field("name", &self.reconciler.name())
            .field("kind", &self.reconciler.kind())
            .field("max_concurrent_reconciles", &self.max_concurrent_reconciles)
            .field("watch_filter", &self.watch_filter)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Builder for [`ReconcilerRegistration`].
pub struct Builder {
    registration: ReconcilerRegistration,
}

impl Builder {
    /// Sets the maximum number of in-flight reconciliations.
    pub fn max_concurrent_reconciles(mut self, n: usize) -> Self {
        self.registration.max_concurrent_reconciles = n;
        self
    }

    /// Restricts reconciliation to objects labelled with this value.
    pub fn watch_filter(mut self, value: impl Into<String>) -> Self {
        self.registration.watch_filter = WatchFilter::new(value);
        self
    }

    /// Attaches a feature-derived behavioral flag.
    pub fn flag(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.registration.flags.insert(name.into(), enabled);
        self
    }

    pub fn build(self) -> ReconcilerRegistration {
        self.registration
    }
}

/// Ordered set of reconciler registrations, one per kind.
#[derive(Default)]
pub struct ReconcilerRegistry {
    registrations: Vec<ReconcilerRegistration>,
    kinds: HashSet<String>,
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registration. Rejects invalid registrations and second
    /// registrations for a kind.
    pub fn register(&mut self, registration: ReconcilerRegistration) -> Result<(), RegistrationError> {
        registration.validate()?;

        let kind = kind_string(&registration.kind());
        if self.kinds.contains(&kind) {
            return Err(RegistrationError::DuplicateKind(kind));
        }

        tracing::debug!(
            controller = registration.reconciler.name(),
            kind = %kind,
            concurrency = registration.max_concurrent_reconciles,
            "registered controller"
        );
        self.kinds.insert(kind);
        self.registrations.push(registration);
        Ok(())
    }

    /// Returns true if a reconciler is bound for this kind.
    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains(&kind_string(gvk))
    }

    /// Registrations in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ReconcilerRegistration> {
        self.registrations.iter()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

/// Binds an admission webhook to the manager.
#[derive(Clone)]
pub struct WebhookRegistration {
    webhook: Arc<dyn AdmissionWebhook>,
}

impl WebhookRegistration {
    pub fn new(webhook: Arc<dyn AdmissionWebhook>) -> Self {
        Self { webhook }
    }

    pub fn kind(&self) -> GroupVersionKind {
        self.webhook.kind()
    }

    pub fn webhook(&self) -> &Arc<dyn AdmissionWebhook> {
        &self.webhook
    }
}

impl fmt::Debug for WebhookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookRegistration")
            .field("kind", &self.webhook.kind())
            .finish()
    }
}

/// Ordered set of webhook registrations, one per kind.
#[derive(Default)]
pub struct WebhookRegistry {
    registrations: Vec<WebhookRegistration>,
    kinds: HashSet<String>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registration, rejecting a second one for the same kind.
    pub fn register(&mut self, registration: WebhookRegistration) -> Result<(), RegistrationError> {
        let kind = kind_string(&registration.kind());
        if !self.kinds.insert(kind.clone()) {
            return Err(RegistrationError::DuplicateKind(kind));
        }
        self.registrations.push(registration);
        Ok(())
    }

    /// Returns true if a webhook for `gvk` is registered.
    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains(&kind_string(gvk))
    }

    pub fn iter(&self) -> impl Iterator<Item = &WebhookRegistration> {
        self.registrations.iter()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
