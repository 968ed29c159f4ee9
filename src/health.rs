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

//! Liveness and readiness probes.
//!
//! The manager keeps two named check registries, one for `/healthz` and one
//! for `/readyz`. Each check can also be queried on its own under
//! `/healthz/<name>` or `/readyz/<name>`.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::BindAddress;

/// Boxed future for health checks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors of the probe registries and server.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("check {0:?} is already registered")]
    DuplicateCheck(String),

    #[error("check name must not be empty")]
    EmptyName,

    #[error("failed to bind probe server on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("probe server accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// A single named probe check.
///
/// `Err` carries the reason reported to the prober.
pub trait HealthChecker: Send + Sync + 'static {
    fn check(&self) -> BoxFuture<'_, Result<(), String>>;
}

/// Adapter for implementing [`HealthChecker`] with a function.
pub struct FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    check_fn: F,
}

impl<F, Fut> FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    pub fn new(check_fn: F) -> Self {
        Self { check_fn }
    }
}

impl<F, Fut> HealthChecker for FunctionHealthChecker<F, Fut>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin((self.check_fn)())
    }
}

/// Always succeeds. Useful as a trivial liveness or readiness check.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

impl HealthChecker for Ping {
    fn check(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async { Ok(()) })
    }
}

/// Outcome of running a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Per-check results, by name.
    pub checks: BTreeMap<String, Result<(), String>>,
}

impl ProbeReport {
    pub fn healthy(&self) -> bool {
        self.checks.values().all(Result::is_ok)
    }

    /// Renders the report the way controller-runtime does: `ok` when
    /// healthy, otherwise one `[+]`/`[-]` line per check.
    pub fn render(&self, probe: &str) -> String {
        if self.healthy() {
            return "ok".to_string();
        }

        let mut out = String::new();
        for (name, result) in &self.checks {
            match result {
                Ok(()) => out.push_str(&format!("[+]{} ok\n", name)),
                Err(reason) => out.push_str(&format!("[-]{} failed: {}\n", name, reason)),
            }
        }
        out.push_str(&format!("{} check failed", probe));
        out
    }
}

/// A named set of checks behind one probe endpoint.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<BTreeMap<String, Arc<dyn HealthChecker>>>>,
}

impl HealthRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a check under `name`.
    pub async fn register(&self, name: &str, checker: Arc<dyn HealthChecker>) -> Result<(), HealthError> {
        if name.is_empty() {
            return Err(HealthError::EmptyName);
        }
        let mut checkers = self.checkers.write().await;
        if checkers.contains_key(name) {
            return Err(HealthError::DuplicateCheck(name.to_string()));
        }
        checkers.insert(name.to_string(), checker);
        Ok(())
    }

    /// Runs every check.
    pub async fn check_all(&self) -> ProbeReport {
        let checkers = self.checkers.read().await;
        let mut checks = BTreeMap::new();
        for (name, checker) in checkers.iter() {
            checks.insert(name.clone(), checker.check().await);
        }
        ProbeReport { checks }
    }

    /// Runs a single check, `None` if it isn't registered.
    pub async fn check(&self, name: &str) -> Option<Result<(), String>> {
        let checker = self.checkers.read().await.get(name).cloned()?;
        Some(checker.check().await)
    }

    /// Returns the number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// Returns true if there are no registered checkers.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// Serves `/healthz` and `/readyz` until cancelled.
pub struct HealthServer {
    healthz: HealthRegistry,
    readyz: HealthRegistry,
    address: BindAddress,
}

impl HealthServer {
    pub fn new(address: BindAddress, healthz: HealthRegistry, readyz: HealthRegistry) -> Self {
        Self {
            healthz,
            readyz,
            address,
        }
    }

    /// Binds the listener. Bind failures surface before the server runs.
    pub async fn bind(&self) -> Result<TcpListener, HealthError> {
        let address = self.address.to_listen_string();
        TcpListener::bind(&address)
            .await
            .map_err(|source| HealthError::Bind { address, source })
    }

    /// Runs the server on an already bound listener.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<(), HealthError> {
        tracing::info!(address = %self.address, "health probe server listening");

        let registries = Arc::new((self.healthz, self.readyz));
        serve_http(listener, cancel, move |req| {
            let registries = registries.clone();
            async move {
                let response = handle_request(req.uri().path(), &registries.0, &registries.1).await;
                Ok::<_, hyper::Error>(response)
            }
        })
        .await
    }
}

/// Accept loop shared by the plain-HTTP servers.
pub(crate) async fn serve_http<H, Fut>(
    listener: TcpListener,
    cancel: CancellationToken,
    handler: H,
) -> Result<(), HealthError>
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Full<Bytes>>, hyper::Error>> + Send + 'static,
{
    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted.map_err(HealthError::Accept)?,
            _ = cancel.cancelled() => return Ok(()),
        };

        let handler = handler.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| handler(req));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(error = %e, "probe connection error");
            }
        });
    }
}

/// Routes a probe path to its registry.
pub async fn handle_request(
    path: &str,
    healthz: &HealthRegistry,
    readyz: &HealthRegistry,
) -> Response<Full<Bytes>> {
    let (probe, registry, rest) = if let Some(rest) = path.strip_prefix("/healthz") {
        ("healthz", healthz, rest)
    } else if let Some(rest) = path.strip_prefix("/readyz") {
        ("readyz", readyz, rest)
    } else {
        return text(StatusCode::NOT_FOUND, "not found".to_string());
    };

    match rest.trim_end_matches('/') {
        "" => {
            let report = registry.check_all().await;
            let status = if report.healthy() {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            text(status, report.render(probe))
        }
        name => match registry.check(name.trim_start_matches('/')).await {
            Some(Ok(())) => text(StatusCode::OK, "ok".to_string()),
            Some(Err(reason)) => text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal server error: {}", reason),
            ),
            None => text(StatusCode::NOT_FOUND, "not found".to_string()),
        },
    }
}

pub(crate) fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_registry() {
        let registry = HealthRegistry::new();
        registry.register("ping", Arc::new(Ping)).await.unwrap();

        assert_eq!(registry.len().await, 1);
        assert!(!registry.is_empty().await);

        let report = registry.check_all().await;
        assert!(report.healthy());
        assert_eq!(report.render("healthz"), "ok");

        assert!(matches!(
            registry.register("ping", Arc::new(Ping)).await,
            Err(HealthError::DuplicateCheck(_))
        ));
        assert!(matches!(
            registry.register("", Arc::new(Ping)).await,
            Err(HealthError::EmptyName)
        ));
    }

    #[tokio::test]
    async fn test_unhealthy_checker() {
        let registry = HealthRegistry::new();
        registry.register("ping", Arc::new(Ping)).await.unwrap();
        registry
            .register(
                "cache",
                Arc::new(FunctionHealthChecker::new(|| async { Err("not synced".to_string()) })),
            )
            .await
            .unwrap();

        let report = registry.check_all().await;
        assert!(!report.healthy());
        let rendered = report.render("readyz");
        assert!(rendered.contains("[-]cache failed: not synced"));
        assert!(rendered.contains("[+]ping ok"));
    }

    #[tokio::test]
    async fn test_probe_routes() {
        let healthz = HealthRegistry::new();
        let readyz = HealthRegistry::new();
        healthz.register("ping", Arc::new(Ping)).await.unwrap();
        readyz.register("ping", Arc::new(Ping)).await.unwrap();

        let response = handle_request("/healthz", &healthz, &readyz).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "ok");

        let response = handle_request("/readyz/ping", &healthz, &readyz).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_request("/readyz/missing", &healthz, &readyz).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = handle_request("/metrics", &healthz, &readyz).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failing_probe_returns_500() {
        let healthz = HealthRegistry::new();
        let readyz = HealthRegistry::new();
        readyz
            .register(
                "webhook",
                Arc::new(FunctionHealthChecker::new(|| async { Err("no certs".to_string()) })),
            )
            .await
            .unwrap();

        let response = handle_request("/readyz", &healthz, &readyz).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(response).await.contains("readyz check failed"));

        let response = handle_request("/readyz/webhook", &healthz, &readyz).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let healthz = HealthRegistry::new();
        healthz.register("ping", Arc::new(Ping)).await.unwrap();
        let server = HealthServer::new(
            "127.0.0.1:0".parse().unwrap(),
            healthz,
            HealthRegistry::new(),
        );
        let listener = server.bind().await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.serve(listener, cancel.clone()));
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
