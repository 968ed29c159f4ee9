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

//! Registry of the resource kinds the manager can watch and admit.
//!
//! The scheme is populated explicitly during startup so that every test can
//! build its own isolated instance.

use std::collections::HashSet;

pub use kube::core::GroupVersionKind;

/// API group of the EKS control plane types.
pub const CONTROLPLANE_GROUP: &str = "controlplane.cluster.x-k8s.io";

/// API group of the AWS infrastructure types.
pub const INFRASTRUCTURE_GROUP: &str = "infrastructure.cluster.x-k8s.io";

/// API group of the core Cluster API types.
pub const CLUSTER_API_GROUP: &str = "cluster.x-k8s.io";

/// Formats a kind the way apimachinery does: `group/version, Kind=Name`.
pub fn kind_string(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}, Kind={}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Set of known kinds, kept in registration order.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    kinds: Vec<GroupVersionKind>,
    index: HashSet<GroupVersionKind>,
}

impl Scheme {
    /// Creates an empty scheme.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the given kinds of one group version. Re-adding is a no-op.
    pub fn add_known_types(&mut self, group: &str, version: &str, kinds: &[&str]) -> &mut Self {
        for kind in kinds {
            let gvk = GroupVersionKind::gvk(group, version, kind);
            if self.index.insert(gvk.clone()) {
                self.kinds.push(gvk);
            }
        }
        self
    }

    /// Returns true if the kind has been registered.
    pub fn recognizes(&self, gvk: &GroupVersionKind) -> bool {
        self.index.contains(gvk)
    }

    /// Returns all registered kinds.
    pub fn all_kinds(&self) -> &[GroupVersionKind] {
        &self.kinds
    }

    /// Returns the number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns true if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Adds the core Kubernetes kinds the manager reads or emits.
pub fn add_core_to_scheme(scheme: &mut Scheme) {
    scheme.add_known_types("", "v1", &["Secret", "ConfigMap", "Event", "Namespace"]);
}

/// Adds the EKS control plane kinds for every served version.
pub fn add_controlplane_to_scheme(scheme: &mut Scheme) {
    for version in ["v1alpha3", "v1alpha4"] {
        scheme.add_known_types(
            CONTROLPLANE_GROUP,
            version,
            &["AWSManagedControlPlane", "AWSManagedControlPlaneList"],
        );
    }
}

/// Adds the AWS infrastructure kinds for every served version.
pub fn add_infrastructure_to_scheme(scheme: &mut Scheme) {
    for version in ["v1alpha3", "v1alpha4"] {
        scheme.add_known_types(
            INFRASTRUCTURE_GROUP,
            version,
            &[
                "AWSCluster",
                "AWSClusterList",
                "AWSMachine",
                "AWSMachineList",
                "AWSMachineTemplate",
                "AWSMachineTemplateList",
                "AWSManagedMachinePool",
                "AWSManagedMachinePoolList",
                "AWSFargateProfile",
                "AWSFargateProfileList",
                "AWSMachinePool",
                "AWSMachinePoolList",
            ],
        );
    }
}

/// Adds the Cluster API kinds the control plane controller watches.
pub fn add_cluster_api_to_scheme(scheme: &mut Scheme) {
    scheme.add_known_types(
        CLUSTER_API_GROUP,
        "v1alpha4",
        &["Cluster", "ClusterList", "Machine", "MachineList"],
    );
}

/// Builds the scheme used by the EKS control plane manager.
pub fn default_scheme() -> Scheme {
    let mut scheme = Scheme::new();
    add_core_to_scheme(&mut scheme);
    add_controlplane_to_scheme(&mut scheme);
    add_infrastructure_to_scheme(&mut scheme);
    add_cluster_api_to_scheme(&mut scheme);
    scheme
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scheme_recognizes_control_plane() {
        let scheme = default_scheme();
        let gvk = GroupVersionKind::gvk(CONTROLPLANE_GROUP, "v1alpha4", "AWSManagedControlPlane");
        assert!(scheme.recognizes(&gvk));

        let unknown = GroupVersionKind::gvk(CONTROLPLANE_GROUP, "v1beta1", "AWSManagedControlPlane");
        assert!(!scheme.recognizes(&unknown));
    }

    #[test]
    fn test_schemes_are_isolated() {
        let mut a = Scheme::new();
        let b = Scheme::new();
        a.add_known_types("example.com", "v1", &["Widget"]);
        a.add_known_types("example.com", "v1", &["Widget"]);

        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn test_kind_string() {
        let gvk = GroupVersionKind::gvk(CONTROLPLANE_GROUP, "v1alpha4", "AWSManagedControlPlane");
        assert_eq!(
            kind_string(&gvk),
            "controlplane.cluster.x-k8s.io/v1alpha4, Kind=AWSManagedControlPlane"
        );
        assert_eq!(
            kind_string(&GroupVersionKind::gvk("", "v1", "Secret")),
            "v1, Kind=Secret"
        );
    }
}
