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

//! Feature gate support.
//!
//! Gates are registered with their defaults, overridden once from the
//! command line as a single batch, and then checked against their declared
//! dependencies before anything reads them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Error type for feature gate operations.
#[derive(Debug, thiserror::Error)]
pub enum FeatureGateError {
    #[error("unknown feature gate: {0}")]
    UnknownFeature(String),

    #[error("feature gate {0} is already registered")]
    AlreadyRegistered(String),

    #[error("feature gate {0} is locked to {1} and cannot be changed")]
    Locked(String, bool),

    #[error("invalid value for feature gate {0}: expected bool, got {1:?}")]
    InvalidValue(String, String),

    #[error("malformed feature gate entry {0:?}: expected Name=bool")]
    Malformed(String),
}

/// Result type for feature gate operations.
pub type Result<T> = std::result::Result<T, FeatureGateError>;

/// A dependent gate is enabled while its prerequisite is disabled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid feature gate combination: {dependent} requires {prerequisite} to be enabled")]
pub struct InvalidFeatureGateCombination {
    /// The gate that was enabled.
    pub dependent: String,
    /// The gate it needs.
    pub prerequisite: String,
}

/// Read-only view over feature gates, handed to collaborators.
pub trait FeatureGate: Send + Sync {
    /// Returns true if the given feature gate is enabled.
    fn enabled(&self, feature: &str) -> bool;

    /// Returns all known feature gates and their current values.
    fn all_features(&self) -> BTreeMap<String, bool>;
}

/// Maturity of a feature gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreRelease {
    /// Off by default, may change or disappear.
    Alpha,
    /// Well tested, may change.
    Beta,
    /// Generally available.
    Ga,
}

impl fmt::Display for PreRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreRelease::Alpha => f.write_str("ALPHA"),
            PreRelease::Beta => f.write_str("BETA"),
            PreRelease::Ga => f.write_str("GA"),
        }
    }
}

/// Registration data of a single gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSpec {
    /// State when no override is given.
    pub default: bool,
    /// Maturity of the gate.
    pub pre_release: PreRelease,
    /// Whether overrides are refused.
    pub lock_to_default: bool,
}

impl FeatureSpec {
    /// An overridable gate.
    pub const fn new(default: bool, pre_release: PreRelease) -> Self {
        Self {
            default,
            pre_release,
            lock_to_default: false,
        }
    }
}

/// Declares that `dependent` may only be on when `prerequisite` is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDependency {
    /// The gate that needs another one.
    pub dependent: &'static str,
    /// The gate that must be enabled first.
    pub prerequisite: &'static str,
}

/// Set of known feature gates and their current state.
#[derive(Debug, Clone, Default)]
pub struct FeatureGateSet {
    known: BTreeMap<String, FeatureSpec>,
    overrides: BTreeMap<String, bool>,
}

impl FeatureGateSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers gates with their defaults.
    ///
    /// Registration must happen before any override is applied.
    pub fn add(
        &mut self,
        features: impl IntoIterator<Item = (&'static str, FeatureSpec)>,
    ) -> Result<()> {
        for (name, spec) in features {
            if self.known.contains_key(name) {
                return Err(FeatureGateError::AlreadyRegistered(name.to_string()));
            }
            self.known.insert(name.to_string(), spec);
        }
        Ok(())
    }

    /// Overrides a single gate.
    pub fn set(&mut self, feature: &str, enabled: bool) -> Result<()> {
        self.check_override(feature, enabled)?;
        self.overrides.insert(feature.to_string(), enabled);
        Ok(())
    }

    /// Applies a batch of overrides.
    ///
    /// Either every entry is applied or none is.
    pub fn set_from_map(&mut self, overrides: &HashMap<String, bool>) -> Result<()> {
        for (name, enabled) in overrides {
            self.check_override(name, *enabled)?;
        }
        for (name, enabled) in overrides {
            self.overrides.insert(name.clone(), *enabled);
        }
        Ok(())
    }

    /// Applies overrides from a comma-separated list.
    ///
    /// Format: "Feature1=true,Feature2=false"
    pub fn set_from_string(&mut self, s: &str) -> Result<()> {
        let mut overrides = HashMap::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (name, value) = part
                .split_once('=')
                .ok_or_else(|| FeatureGateError::Malformed(part.to_string()))?;
            let name = name.trim();
            let value = value.trim();

            let enabled = value
                .parse::<bool>()
                .map_err(|_| FeatureGateError::InvalidValue(name.to_string(), value.to_string()))?;

            overrides.insert(name.to_string(), enabled);
        }
        self.set_from_map(&overrides)
    }

    /// Returns true if the given gate is enabled. Unknown gates are off.
    pub fn enabled(&self, feature: &str) -> bool {
        match self.overrides.get(feature) {
            Some(enabled) => *enabled,
            None => self.known.get(feature).map(|s| s.default).unwrap_or(false),
        }
    }

    /// Checks if a feature gate exists.
    pub fn contains(&self, feature: &str) -> bool {
        self.known.contains_key(feature)
    }

    /// Returns the registration of a gate.
    pub fn spec(&self, feature: &str) -> Option<FeatureSpec> {
        self.known.get(feature).copied()
    }

    /// Checks dependency invariants against the current state.
    pub fn validate(
        &self,
        dependencies: &[GateDependency],
    ) -> std::result::Result<(), InvalidFeatureGateCombination> {
        for dep in dependencies {
            if self.enabled(dep.dependent) && !self.enabled(dep.prerequisite) {
                return Err(InvalidFeatureGateCombination {
                    dependent: dep.dependent.to_string(),
                    prerequisite: dep.prerequisite.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_override(&self, feature: &str, enabled: bool) -> Result<()> {
        let spec = self
            .known
            .get(feature)
            .ok_or_else(|| FeatureGateError::UnknownFeature(feature.to_string()))?;

        if spec.lock_to_default && spec.default != enabled {
            return Err(FeatureGateError::Locked(feature.to_string(), spec.default));
        }
        Ok(())
    }
}

impl FeatureGate for FeatureGateSet {
    fn enabled(&self, feature: &str) -> bool {
        FeatureGateSet::enabled(self, feature)
    }

    fn all_features(&self) -> BTreeMap<String, bool> {
        self.known
            .keys()
            .map(|name| (name.clone(), FeatureGateSet::enabled(self, name)))
            .collect()
    }
}

impl fmt::Display for FeatureGateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, spec) in &self.known {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}={} ({})", name, self.enabled(name), spec.pre_release)?;
        }
        Ok(())
    }
}

/// Feature gates of the AWS infrastructure provider.
pub mod capa {
    use std::collections::BTreeMap;

    use super::{FeatureGateSet, FeatureSpec, GateDependency, PreRelease};

    /// Enables EKS support.
    pub const EKS: &str = "EKS";

    /// Lets the controller create IAM roles for EKS clusters.
    pub const EKS_ENABLE_IAM: &str = "EKSEnableIAM";

    /// Lets additional roles be attached to the EKS control plane role.
    pub const EKS_ALLOW_ADD_ROLES: &str = "EKSAllowAddRoles";

    /// Enables EKS Fargate profiles.
    pub const EKS_FARGATE: &str = "EKSFargate";

    /// Enables machine pools.
    pub const MACHINE_POOL: &str = "MachinePool";

    /// Enables EventBridge driven instance state.
    pub const EVENT_BRIDGE_INSTANCE_STATE: &str = "EventBridgeInstanceState";

    /// Creates the default controller identity automatically.
    pub const AUTO_CONTROLLER_IDENTITY_CREATOR: &str = "AutoControllerIdentityCreator";

    /// Inter-gate constraints checked at startup.
    pub const DEPENDENCIES: &[GateDependency] = &[GateDependency {
        dependent: EKS_ALLOW_ADD_ROLES,
        prerequisite: EKS_ENABLE_IAM,
    }];

    const DEFAULT_FEATURES: &[(&str, FeatureSpec)] = &[
        (EKS, FeatureSpec::new(true, PreRelease::Beta)),
        (EKS_ENABLE_IAM, FeatureSpec::new(false, PreRelease::Alpha)),
        (EKS_ALLOW_ADD_ROLES, FeatureSpec::new(false, PreRelease::Alpha)),
        (EKS_FARGATE, FeatureSpec::new(false, PreRelease::Alpha)),
        (MACHINE_POOL, FeatureSpec::new(false, PreRelease::Alpha)),
        (EVENT_BRIDGE_INSTANCE_STATE, FeatureSpec::new(false, PreRelease::Alpha)),
        (AUTO_CONTROLLER_IDENTITY_CREATOR, FeatureSpec::new(true, PreRelease::Alpha)),
    ];

    /// Returns the default provider feature gates.
    pub fn default_features() -> &'static [(&'static str, FeatureSpec)] {
        DEFAULT_FEATURES
    }

    /// Returns a gate set with every provider gate at its default.
    pub fn default_gate_set() -> FeatureGateSet {
        FeatureGateSet {
            known: DEFAULT_FEATURES
                .iter()
                .map(|(name, spec)| (name.to_string(), *spec))
                .collect(),
            overrides: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gates() -> FeatureGateSet {
        let mut fg = FeatureGateSet::new();
        fg.add([
            ("feature1", FeatureSpec::new(false, PreRelease::Alpha)),
            ("feature2", FeatureSpec::new(true, PreRelease::Beta)),
            (
                "locked",
                FeatureSpec {
                    default: true,
                    pre_release: PreRelease::Ga,
                    lock_to_default: true,
                },
            ),
        ])
        .unwrap();
        fg
    }

    #[test]
    fn test_feature_gate_defaults_and_set() {
        let mut fg = gates();
        assert!(!fg.enabled("feature1"));
        assert!(fg.enabled("feature2"));

        fg.set("feature1", true).unwrap();
        assert!(fg.enabled("feature1"));
    }

    #[test]
    fn test_feature_gate_locked() {
        let mut fg = gates();
        assert!(fg.set("locked", false).is_err());
        assert!(fg.set("locked", true).is_ok());
        assert!(fg.enabled("locked"));
    }

    #[test]
    fn test_feature_gate_unknown() {
        let mut fg = gates();
        assert!(!fg.enabled("unknown-feature"));
        assert!(matches!(
            fg.set("unknown-feature", true),
            Err(FeatureGateError::UnknownFeature(_))
        ));
    }

    #[test]
    fn test_feature_gate_duplicate_registration() {
        let mut fg = gates();
        let err = fg
            .add([("feature1", FeatureSpec::new(true, PreRelease::Alpha))])
            .unwrap_err();
        assert!(matches!(err, FeatureGateError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_feature_gate_from_string() {
        let mut fg = gates();
        fg.set_from_string("feature1=true, feature2=false").unwrap();
        assert!(fg.enabled("feature1"));
        assert!(!fg.enabled("feature2"));
    }

    #[test]
    fn test_feature_gate_batch_is_atomic() {
        let mut fg = gates();
        assert!(fg.set_from_string("feature1=true,bogus=true").is_err());
        assert!(!fg.enabled("feature1"));

        assert!(fg.set_from_string("feature1=true,feature2=maybe").is_err());
        assert!(!fg.enabled("feature1"));

        assert!(matches!(
            fg.set_from_string("feature1"),
            Err(FeatureGateError::Malformed(_))
        ));
    }

    #[test]
    fn test_allow_add_roles_requires_enable_iam() {
        for (enable_iam, allow_add_roles) in
            [(false, false), (true, false), (true, true), (false, true)]
        {
            let mut fg = capa::default_gate_set();
            fg.set(capa::EKS_ENABLE_IAM, enable_iam).unwrap();
            fg.set(capa::EKS_ALLOW_ADD_ROLES, allow_add_roles).unwrap();

            let result = fg.validate(capa::DEPENDENCIES);
            if allow_add_roles && !enable_iam {
                let err = result.unwrap_err();
                assert_eq!(err.dependent, capa::EKS_ALLOW_ADD_ROLES);
                assert_eq!(err.prerequisite, capa::EKS_ENABLE_IAM);
            } else {
                assert!(result.is_ok());
            }
        }
    }

    #[test]
    fn test_capa_defaults() {
        let fg = capa::default_gate_set();
        assert!(fg.enabled(capa::EKS));
        assert!(!fg.enabled(capa::EKS_ENABLE_IAM));
        assert!(!fg.enabled(capa::EKS_ALLOW_ADD_ROLES));
        assert_eq!(fg.all_features().len(), capa::default_features().len());
        assert!(fg.to_string().contains("EKSEnableIAM=false (ALPHA)"));
    }

    #[test]
    fn test_capa_default_names_are_unique() {
        let mut fg = FeatureGateSet::new();
        fg.add(capa::default_features().iter().copied()).unwrap();
        assert_eq!(fg.all_features().len(), capa::default_features().len());
    }
}
