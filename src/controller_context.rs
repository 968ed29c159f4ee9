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

//! Per-controller context handed to reconcilers when they start.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use rand::Rng;

use crate::scheme::GroupVersionKind;

/// Label key used to restrict which objects a controller reconciles.
pub const WATCH_LABEL: &str = "cluster.x-k8s.io/watch-filter";

const MAX_LABEL_VALUE_LEN: usize = 63;

/// The watch-filter label value is not a valid Kubernetes label value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid watch filter {value:?}: {reason}")]
pub struct InvalidWatchFilter {
    /// The rejected value.
    pub value: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// Restricts reconciliation to objects carrying [`WATCH_LABEL`] with a
/// given value. An empty value matches every object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchFilter {
    value: String,
}

impl WatchFilter {
    /// Creates a filter for the given label value.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// The label value, empty when unfiltered.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns true when every object is watched.
    pub fn is_unfiltered(&self) -> bool {
        self.value.is_empty()
    }

    /// Checks the value against the Kubernetes label value syntax.
    pub fn validate(&self) -> Result<(), InvalidWatchFilter> {
        let value = self.value.as_str();
        if value.is_empty() {
            return Ok(());
        }

        let invalid = |reason| InvalidWatchFilter {
            value: value.to_string(),
            reason,
        };

        if value.len() > MAX_LABEL_VALUE_LEN {
            return Err(invalid("must be no more than 63 characters"));
        }
        let bytes = value.as_bytes();
        if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
            return Err(invalid("must start and end with an alphanumeric character"));
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            return Err(invalid("may only contain alphanumerics, '-', '_' or '.'"));
        }
        Ok(())
    }

    /// Returns a label selector for list/watch calls, `None` when unfiltered.
    pub fn label_selector(&self) -> Option<String> {
        (!self.is_unfiltered()).then(|| format!("{}={}", WATCH_LABEL, self.value))
    }

    /// Returns true if an object with these labels should be reconciled.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.is_unfiltered() || labels.get(WATCH_LABEL).map(String::as_str) == Some(&self.value)
    }
}

/// Shared context for a single controller.
///
/// Built by the manager from the controller's registration and the process
/// configuration.
#[derive(Clone)]
pub struct ReconcilerContext {
    /// Kind reconciled by this controller.
    pub kind: GroupVersionKind,

    /// Maximum number of reconciliations in flight at once.
    pub max_concurrent_reconciles: usize,

    /// Objects to reconcile.
    pub watch_filter: WatchFilter,

    /// Namespace to watch, `None` for all namespaces.
    pub namespace: Option<String>,

    /// Feature-derived flags attached at registration.
    pub flags: Arc<BTreeMap<String, bool>>,

    /// Kubernetes client, absent when the manager runs without a cluster.
    pub client: Option<Client>,

    sync_period: Duration,
}

impl ReconcilerContext {
    /// Creates a new controller context.
    pub fn new(
        kind: GroupVersionKind,
        max_concurrent_reconciles: usize,
        watch_filter: WatchFilter,
        namespace: Option<String>,
        flags: BTreeMap<String, bool>,
        sync_period: Duration,
        client: Option<Client>,
    ) -> Self {
        Self {
            kind,
            max_concurrent_reconciles,
            watch_filter,
            namespace,
            flags: Arc::new(flags),
            client,
            sync_period,
        }
    }

    /// Returns the configured sync period.
    pub fn sync_period(&self) -> Duration {
        self.sync_period
    }

    /// Returns a jittered resync period.
    ///
    /// Jitter only shortens the period so the configured ceiling holds,
    /// while keeping controllers from resyncing in lockstep.
    pub fn resync_period(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..0.1);
        Duration::from_secs_f64(self.sync_period.as_secs_f64() * (1.0 - jitter))
    }

    /// Returns a feature flag, false when not attached.
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

impl std::fmt::Debug for ReconcilerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerContext")
            .field("kind", &self.kind)
            .field("max_concurrent_reconciles", &self.max_concurrent_reconciles)
            .field("watch_filter", &self.watch_filter)
            .field("namespace", &self.namespace)
            .field("flags", &self.flags)
            .field("sync_period", &self.sync_period)
            .field("has_client", &self.client.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(period: Duration) -> ReconcilerContext {
        ReconcilerContext::new(
            GroupVersionKind::gvk("example.com", "v1", "Widget"),
            4,
            WatchFilter::default(),
            None,
            BTreeMap::from([("EnableIAM".to_string(), true)]),
            period,
            None,
        )
    }

    #[test]
    fn test_resync_period_never_exceeds_sync_period() {
        let base = Duration::from_secs(600);
        let ctx = context(base);

        let mut periods = std::collections::HashSet::new();
        for _ in 0..20 {
            let period = ctx.resync_period();
            assert!(period <= base);
            assert!(period >= Duration::from_secs(540));
            periods.insert(period);
        }
        assert!(periods.len() > 1);
    }

    #[test]
    fn test_flags() {
        let ctx = context(Duration::from_secs(60));
        assert!(ctx.flag("EnableIAM"));
        assert!(!ctx.flag("AllowAdditionalRoles"));
    }

    #[test]
    fn test_watch_filter_matching() {
        let unfiltered = WatchFilter::default();
        assert!(unfiltered.matches(&BTreeMap::new()));
        assert!(unfiltered.label_selector().is_none());

        let filter = WatchFilter::new("team-a");
        assert_eq!(
            filter.label_selector().as_deref(),
            Some("cluster.x-k8s.io/watch-filter=team-a")
        );
        assert!(!filter.matches(&BTreeMap::new()));
        assert!(filter.matches(&BTreeMap::from([(
            WATCH_LABEL.to_string(),
            "team-a".to_string()
        )])));
        assert!(!filter.matches(&BTreeMap::from([(
            WATCH_LABEL.to_string(),
            "team-b".to_string()
        )])));
    }

    #[test]
    fn test_watch_filter_validation() {
        assert!(WatchFilter::default().validate().is_ok());
        assert!(WatchFilter::new("team-a.prod_1").validate().is_ok());
        assert!(WatchFilter::new("-team").validate().is_err());
        assert!(WatchFilter::new("team a").validate().is_err());
        assert!(WatchFilter::new("a".repeat(64)).validate().is_err());
    }
}
