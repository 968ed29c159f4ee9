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

//! Admission webhook binding and dispatch.
//!
//! Webhook collaborators implement [`AdmissionWebhook`]. The manager's
//! [`WebhookServer`] maps the conventional `/mutate-...` and `/validate-...`
//! paths of each bound kind to its collaborator and serves them over TLS.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tokio::net::TcpListener;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::scheme::GroupVersionKind;

/// Name of the serving certificate inside the cert dir.
pub const CERT_FILE: &str = "tls.crt";

/// Name of the serving key inside the cert dir.
pub const KEY_FILE: &str = "tls.key";

/// Errors of the webhook server.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook path {0} is already bound")]
    PathInUse(String),

    #[error("failed to read serving certificates from {dir:?}: {reason}")]
    Certificates { dir: PathBuf, reason: String },

    #[error("failed to bind webhook server on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("webhook server accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// Which admission phase a path serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionPhase {
    /// Defaulting (mutating) webhook.
    Mutate,
    /// Validating webhook.
    Validate,
}

/// An admission collaborator for one kind.
#[async_trait]
pub trait AdmissionWebhook: Send + Sync + 'static {
    /// Kind admitted by this webhook.
    fn kind(&self) -> GroupVersionKind;

    /// Whether the webhook defaults objects.
    fn mutating(&self) -> bool {
        true
    }

    /// Whether the webhook validates objects.
    fn validating(&self) -> bool {
        true
    }

    /// Handles a defaulting request.
    async fn mutate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse;

    /// Handles a validating request.
    async fn validate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse;
}

/// Returns the controller-runtime path for a kind and phase, e.g.
/// `/validate-controlplane-cluster-x-k8s-io-v1alpha4-awsmanagedcontrolplane`.
pub fn webhook_path(phase: AdmissionPhase, gvk: &GroupVersionKind) -> String {
    let prefix = match phase {
        AdmissionPhase::Mutate => "mutate",
        AdmissionPhase::Validate => "validate",
    };
    let group = gvk.group.replace('.', "-");
    if group.is_empty() {
        format!("/{}-{}-{}", prefix, gvk.version, gvk.kind.to_lowercase())
    } else {
        format!(
            "/{}-{}-{}-{}",
            prefix,
            group,
            gvk.version,
            gvk.kind.to_lowercase()
        )
    }
}

type Route = (AdmissionPhase, Arc<dyn AdmissionWebhook>);

/// Routing table of the admission server.
#[derive(Clone, Default)]
pub struct WebhookServer {
    routes: HashMap<String, Route>,
}

impl WebhookServer {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds every phase the webhook serves. Nothing is bound on error.
    pub fn register(&mut self, webhook: Arc<dyn AdmissionWebhook>) -> Result<Vec<String>, WebhookError> {
        let kind = webhook.kind();
        let mut paths = Vec::new();
        if webhook.mutating() {
            paths.push((webhook_path(AdmissionPhase::Mutate, &kind), AdmissionPhase::Mutate));
        }
        if webhook.validating() {
            paths.push((webhook_path(AdmissionPhase::Validate, &kind), AdmissionPhase::Validate));
        }

        if let Some((path, _)) = paths.iter().find(|(p, _)| self.routes.contains_key(p)) {
            return Err(WebhookError::PathInUse(path.clone()));
        }

        for (path, phase) in &paths {
            tracing::info!(path = %path, kind = %kind.kind, "registering webhook");
            self.routes.insert(path.clone(), (*phase, webhook.clone()));
        }
        Ok(paths.into_iter().map(|(p, _)| p).collect())
    }

    /// Returns true when no webhook is bound.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Returns the bound paths.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Routes an admission review to the webhook bound at `path`.
    ///
    /// Returns `None` if nothing is bound there.
    pub async fn dispatch(
        &self,
        path: &str,
        review: AdmissionReview<DynamicObject>,
    ) -> Option<AdmissionReview<DynamicObject>> {
        let (phase, webhook) = self.routes.get(path)?;

        let request: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(path, error = %e, "invalid admission review");
                return Some(AdmissionResponse::invalid(e.to_string()).into_review());
            }
        };

        let response = match phase {
            AdmissionPhase::Mutate => webhook.mutate(&request).await,
            AdmissionPhase::Validate => webhook.validate(&request).await,
        };
        Some(response.into_review())
    }

    /// Serves the bound webhooks over TLS until `cancel` fires.
    pub async fn serve(
        self,
        port: u16,
        cert_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<(), WebhookError> {
        let acceptor = load_tls(cert_dir)?;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| WebhookError::Bind { port, source })?;
        tracing::info!(port, cert_dir = ?cert_dir, "webhook server listening");

        let server = Arc::new(self);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted.map_err(WebhookError::Accept)?,
                _ = cancel.cancelled() => return Ok(()),
            };

            let acceptor = acceptor.clone();
            let server = server.clone();
            tokio::spawn(async move {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                        return;
                    }
                };
                let service = service_fn(move |req| handle_request(req, server.clone()));
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(peer = %peer, error = %e, "webhook connection error");
                }
            });
        }
    }
}

fn load_tls(cert_dir: &Path) -> Result<TlsAcceptor, WebhookError> {
    let certificates = |reason: String| WebhookError::Certificates {
        dir: cert_dir.to_path_buf(),
        reason,
    };

    let cert_pem = std::fs::read(cert_dir.join(CERT_FILE))
        .map_err(|e| certificates(format!("{}: {}", CERT_FILE, e)))?;
    let key_pem = std::fs::read(cert_dir.join(KEY_FILE))
        .map_err(|e| certificates(format!("{}: {}", KEY_FILE, e)))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| certificates(e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| certificates(e.to_string()))?
        .ok_or_else(|| certificates(format!("no private key in {}", KEY_FILE)))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| certificates(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| certificates(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn handle_request(
    req: Request<Incoming>,
    server: Arc<WebhookServer>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();

    if req.method() != Method::POST {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }

    let body = req.into_body().collect().await?.to_bytes();
    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "malformed admission review");
            return Ok(plain(StatusCode::BAD_REQUEST, "malformed admission review"));
        }
    };

    let response = match server.dispatch(&path, review).await {
        Some(review) => review,
        None => return Ok(plain(StatusCode::NOT_FOUND, "not found")),
    };

    match serde_json::to_vec(&response) {
        Ok(json) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))),
        Err(e) => {
            tracing::error!(path = %path, error = %e, "failed to encode admission review");
            Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowAll {
        kind: GroupVersionKind,
        validating: bool,
    }

    #[async_trait]
    impl AdmissionWebhook for AllowAll {
        fn kind(&self) -> GroupVersionKind {
            self.kind.clone()
        }

        fn validating(&self) -> bool {
            self.validating
        }

        async fn mutate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
            AdmissionResponse::from(request)
        }

        async fn validate(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
            AdmissionResponse::from(request).deny("validation refused")
        }
    }

    fn control_plane_kind() -> GroupVersionKind {
        GroupVersionKind::gvk(
            "controlplane.cluster.x-k8s.io",
            "v1alpha4",
            "AWSManagedControlPlane",
        )
    }

    fn review(uid: &str) -> AdmissionReview<DynamicObject> {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": uid,
                "kind": {"group": "controlplane.cluster.x-k8s.io", "version": "v1alpha4", "kind": "AWSManagedControlPlane"},
                "resource": {"group": "controlplane.cluster.x-k8s.io", "version": "v1alpha4", "resource": "awsmanagedcontrolplanes"},
                "operation": "CREATE",
                "userInfo": {},
                "name": "cp-1",
                "namespace": "default",
                "object": {
                    "apiVersion": "controlplane.cluster.x-k8s.io/v1alpha4",
                    "kind": "AWSManagedControlPlane",
                    "metadata": {"name": "cp-1", "namespace": "default"}
                },
                "dryRun": false
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_webhook_paths() {
        let kind = control_plane_kind();
        assert_eq!(
            webhook_path(AdmissionPhase::Mutate, &kind),
            "/mutate-controlplane-cluster-x-k8s-io-v1alpha4-awsmanagedcontrolplane"
        );
        assert_eq!(
            webhook_path(AdmissionPhase::Validate, &kind),
            "/validate-controlplane-cluster-x-k8s-io-v1alpha4-awsmanagedcontrolplane"
        );
    }

    #[test]
    fn test_register_binds_enabled_phases() {
        let mut server = WebhookServer::new();
        let paths = server
            .register(Arc::new(AllowAll {
                kind: control_plane_kind(),
                validating: false,
            }))
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].starts_with("/mutate-"));
    }

    #[test]
    fn test_register_rejects_bound_path() {
        let mut server = WebhookServer::new();
        let webhook = Arc::new(AllowAll {
            kind: control_plane_kind(),
            validating: true,
        });
        server.register(webhook.clone()).unwrap();
        assert!(matches!(
            server.register(webhook),
            Err(WebhookError::PathInUse(_))
        ));
        assert_eq!(server.paths().len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_path() {
        let mut server = WebhookServer::new();
        server
            .register(Arc::new(AllowAll {
                kind: control_plane_kind(),
                validating: true,
            }))
            .unwrap();

        let mutate = webhook_path(AdmissionPhase::Mutate, &control_plane_kind());
        let response = server.dispatch(&mutate, review("a")).await.unwrap();
        let response = response.response.unwrap();
        assert!(response.allowed);
        assert_eq!(response.uid, "a");

        let validate = webhook_path(AdmissionPhase::Validate, &control_plane_kind());
        let response = server.dispatch(&validate, review("b")).await.unwrap();
        assert!(!response.response.unwrap().allowed);

        assert!(server.dispatch("/mutate-unknown", review("c")).await.is_none());
    }

    #[tokio::test]
    async fn test_serve_requires_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let err = WebhookServer::new()
            .serve(0, dir.path(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Certificates { .. }));
    }
}
