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

//! Best-effort diagnostics endpoint.
//!
//! Serves a plain-text runtime summary under `/debug/pprof/`. Failures are
//! logged and never affect the manager.

use std::fmt::Write as _;
use std::time::Instant;

use hyper::StatusCode;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BindAddress;
use crate::health::{serve_http, text};

const PPROF_PREFIX: &str = "/debug/pprof";

/// Diagnostics server.
#[derive(Debug, Clone)]
pub struct Profiler {
    address: BindAddress,
    started: Instant,
}

impl Profiler {
    pub fn new(address: BindAddress) -> Self {
        Self {
            address,
            started: Instant::now(),
        }
    }

    /// Runs the profiler in the background until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let address = self.address.to_listen_string();
            let listener = match TcpListener::bind(&address).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(address = %address, error = %e, "failed to start profiler");
                    return;
                }
            };
            tracing::info!(address = %address, "profiler listening");

            let started = self.started;
            let result = serve_http(listener, cancel, move |req| async move {
                let path = req.uri().path();
                if path.starts_with(PPROF_PREFIX) {
                    Ok::<_, hyper::Error>(text(StatusCode::OK, runtime_summary(started)))
                } else {
                    Ok(text(StatusCode::NOT_FOUND, "not found".to_string()))
                }
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "profiler stopped");
            }
        })
    }
}

/// Renders a short snapshot of the process and runtime.
pub fn runtime_summary(started: Instant) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "pid: {}", std::process::id());
    let _ = writeln!(out, "uptime: {}", humantime::format_duration(started.elapsed()));

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let metrics = handle.metrics();
        let _ = writeln!(out, "runtime_flavor: {:?}", handle.runtime_flavor());
        let _ = writeln!(out, "workers: {}", metrics.num_workers());
        let _ = writeln!(out, "alive_tasks: {}", metrics.num_alive_tasks());
        let _ = writeln!(out, "global_queue_depth: {}", metrics.global_queue_depth());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runtime_summary() {
        let summary = runtime_summary(Instant::now());
        assert!(summary.contains("pid: "));
        assert!(summary.contains("workers: "));
        assert!(summary.contains("alive_tasks: "));
    }

    #[tokio::test]
    async fn test_bind_failure_is_not_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let profiler = Profiler::new(format!("127.0.0.1:{}", port).parse().unwrap());
        // The task logs and returns instead of panicking.
        profiler.spawn(CancellationToken::new()).await.unwrap();
    }
}
