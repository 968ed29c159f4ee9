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

//! Reconciler collaborator interface.
//!
//! Reconcilers own the per-resource state machines. The manager only
//! starts them with a [`ReconcilerContext`] and stops them through a
//! cancellation token.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

use crate::controller_context::ReconcilerContext;
use crate::scheme::GroupVersionKind;

/// Errors a reconciler can surface to the manager.
///
/// Returning one of these from [`Reconciler::run`] is fatal for the whole
/// process; per-object failures must be handled inside the reconciler.
#[derive(Error, Debug)]
pub enum ReconcilerError {
    #[error("controller {name} failed to start: {source}")]
    StartFailed {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("controller {name} runtime error: {source}")]
    Runtime {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for reconciler operations.
pub type Result<T> = std::result::Result<T, ReconcilerError>;

/// A controller that drives objects of one kind toward their desired state.
///
/// # Lifecycle
///
/// 1. The reconciler is bound to the manager through a
///    [`crate::registry::ReconcilerRegistration`]
/// 2. Once the manager runs (and holds leadership), [`Reconciler::run`] is
///    called with the controller's context and a cancellation token
/// 3. On cancellation the reconciler stops taking new work and returns
///    `Ok(())` after in-flight work settles
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs, e.g. `awsmanagedcontrolplane`.
    fn name(&self) -> &str;

    /// Kind reconciled by this controller.
    fn kind(&self) -> GroupVersionKind;

    /// Runs the controller until cancelled.
    async fn run(&self, ctx: ReconcilerContext, cancel: CancellationToken) -> Result<()>;
}

/// Adapts a function into a [`Reconciler`].
pub struct FunctionReconciler<F, Fut>
where
    F: Fn(ReconcilerContext, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    name: String,
    kind: GroupVersionKind,
    run_fn: F,
}

impl<F, Fut> FunctionReconciler<F, Fut>
where
    F: Fn(ReconcilerContext, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    /// Creates a new function-based reconciler.
    pub fn new(name: impl Into<String>, kind: GroupVersionKind, run_fn: F) -> Self {
        Self {
            name: name.into(),
            kind,
            run_fn,
        }
    }
}

impl<F, Fut> fmt::Debug for FunctionReconciler<F, Fut>
where
    F: Fn(ReconcilerContext, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionReconciler")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Reconciler for FunctionReconciler<F, Fut>
where
    F: Fn(ReconcilerContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GroupVersionKind {
        self.kind.clone()
    }

    async fn run(&self, ctx: ReconcilerContext, cancel: CancellationToken) -> Result<()> {
        (self.run_fn)(ctx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_reconciler_identity() {
        let kind = GroupVersionKind::gvk("example.com", "v1", "Widget");
        let reconciler = FunctionReconciler::new("widget", kind.clone(), |_, _| async { Ok(()) });
        assert_eq!(reconciler.name(), "widget");
        assert_eq!(reconciler.kind(), kind);
    }
}
