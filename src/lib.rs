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

//! eks-controlplane-manager - startup orchestration for the EKS control plane
//! controllers
//!
//! This library provides:
//! - Configuration, command-line flags and operational guards
//! - Feature gates and service endpoint overrides
//! - Reconciler and webhook registration
//! - The manager run loop with leader election, probes and event recording

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controlplane;
pub mod endpoints;
pub mod error;
pub mod feature;
pub mod guard;
pub mod health;
pub mod leader_election;
pub mod lifecycle;
pub mod manager;
pub mod options;
pub mod profiler;
pub mod record;
pub mod registry;
pub mod scheme;
pub mod webhook;

// Re-export commonly used types
pub use config::ManagerConfig;
pub use controller::{FunctionReconciler, Reconciler, ReconcilerError};
pub use controller_context::{ReconcilerContext, WatchFilter};
pub use error::StartupError;
pub use feature::{FeatureGate, FeatureGateSet};
pub use lifecycle::{ClientProvider, Collaborators, LifecycleState, ManagerLifecycle};
pub use manager::{ControllerManager, ControllerManagerFactory, Manager, ManagerError, ManagerFactory, ManagerOptions};
pub use options::Options;
pub use registry::{ReconcilerRegistration, WebhookRegistration};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default name for the manager.
pub const MANAGER_NAME: &str = "eks-controlplane-manager";
