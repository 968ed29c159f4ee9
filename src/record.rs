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

//! Event recording.
//!
//! Reconcilers emit events through an [`EventRecorderFacade`]. The facade
//! wraps an [`EventRecorder`] handed out by the manager's
//! [`EventBroadcaster`], which rate limits events per involved object and
//! fans them out to its sinks from a single background task.
//!
//! Events are fire-and-forget: a dropped or failed event never surfaces as
//! an error to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Recorder, Reporter};
use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheme::GroupVersionKind;

/// Burst size of the manager's broadcaster.
///
/// Machine and cluster operations emit enough events to trip a smaller
/// spam filter.
pub const EVENT_BURST_SIZE: usize = 100;

/// Time for one suppressed event slot to become available again.
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_secs(300);

/// Errors of the recorder facade.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("event recorder is already initialized")]
    AlreadyInitialized,
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something the user should look at.
    Warning,
}

/// An event about a Kubernetes object.
#[derive(Debug, Clone)]
pub struct Event {
    /// Component that emitted the event.
    pub source: String,
    /// The object the event is about.
    pub involved_object: ObjectReference,
    /// Severity.
    pub type_: EventType,
    /// Machine-readable reason, e.g. `SuccessfulCreateEKSControlPlane`.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

/// Builds a reference to an object of the given kind.
pub fn object_reference(gvk: &GroupVersionKind, namespace: &str, name: &str) -> ObjectReference {
    let api_version = if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    };
    ObjectReference {
        api_version: Some(api_version),
        kind: Some(gvk.kind.clone()),
        namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

/// Destination of broadcast events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes one event. Failures are logged by the sink.
    async fn publish(&self, event: &Event);
}

/// Writes events to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &Event) {
        let object = &event.involved_object;
        let kind = object.kind.as_deref().unwrap_or_default();
        let namespace = object.namespace.as_deref().unwrap_or_default();
        let name = object.name.as_deref().unwrap_or_default();
        match event.type_ {
            EventType::Normal => tracing::info!(
                target: "events",
                source = %event.source,
                kind,
                namespace,
                name,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Warning => tracing::warn!(
                target: "events",
                source = %event.source,
                kind,
                namespace,
                name,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Publishes events to the apiserver.
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
}

impl KubeEventSink {
    /// Creates a sink using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, event: &Event) {
        let reporter = Reporter {
            controller: event.source.clone(),
            instance: None,
        };
        let recorder = Recorder::new(self.client.clone(), reporter);
        let type_ = match event.type_ {
            EventType::Normal => kube::runtime::events::EventType::Normal,
            EventType::Warning => kube::runtime::events::EventType::Warning,
        };
        let kube_event = kube::runtime::events::Event {
            type_,
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&kube_event, &event.involved_object).await {
            tracing::warn!(
                reason = %event.reason,
                error = %e,
                "failed to publish Kubernetes event"
            );
        }
    }
}

/// Upper bound on the number of spam keys tracked at once.
pub const MAX_SPAM_KEYS: usize = 4096;

/// Token bucket per spam key.
///
/// Each key may emit `burst` events at once; one more slot becomes
/// available every `refill` interval. At most `capacity` keys are tracked;
/// full buckets are dropped first, then the least recently used.
#[derive(Debug)]
pub struct SpamFilter {
    burst: usize,
    refill: Duration,
    capacity: usize,
    buckets: HashMap<String, Bucket>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl SpamFilter {
    /// Creates a filter with the given burst and refill interval.
    pub fn new(burst: usize, refill: Duration) -> Self {
        Self::with_capacity(burst, refill, MAX_SPAM_KEYS)
    }

    /// Creates a filter tracking at most `capacity` keys.
    pub fn with_capacity(burst: usize, refill: Duration, capacity: usize) -> Self {
        Self {
            burst,
            refill,
            capacity: capacity.max(1),
            buckets: HashMap::new(),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Consumes a slot for `key` and returns whether the event may pass.
    pub fn allow(&mut self, key: &str, now: Instant) -> bool {
        if !self.buckets.contains_key(key) && self.buckets.len() >= self.capacity {
            self.evict(now);
        }

        let burst = self.burst as f64;
        let refill = self.refill.as_secs_f64();
        let bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: burst,
            last: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        if refill > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed / refill).min(burst);
        }
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn evict(&mut self, now: Instant) {
        let burst = self.burst as f64;
        let refill = self.refill.as_secs_f64();
        // a full bucket behaves exactly like an untracked key
        self.buckets.retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
            let refilled = if refill > 0.0 { elapsed / refill } else { 0.0 };
            bucket.tokens + refilled < burst
        });

        if self.buckets.len() >= self.capacity {
            let oldest = self
                .buckets
                .iter()
                .min_by_key(|(_, bucket)| bucket.last)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                self.buckets.remove(&key);
            }
        }
    }
}

fn spam_key(source: &str, object: &ObjectReference) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}",
        source,
        object.api_version.as_deref().unwrap_or_default(),
        object.kind.as_deref().unwrap_or_default(),
        object.namespace.as_deref().unwrap_or_default(),
        object.name.as_deref().unwrap_or_default(),
        object.uid.as_deref().unwrap_or_default(),
    )
}

struct Inner {
    burst_size: usize,
    filter: Mutex<SpamFilter>,
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    suppressed: AtomicU64,
}

/// Shared event queue of the manager.
///
/// Cloning is cheap; every clone feeds the same queue.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

impl EventBroadcaster {
    /// Creates a broadcaster that lets `burst_size` events per object
    /// through before suppressing.
    pub fn with_burst_size(burst_size: usize) -> Self {
        Self::with_spam_filter(burst_size, DEFAULT_REFILL_INTERVAL)
    }

    /// Creates a broadcaster with an explicit refill interval.
    pub fn with_spam_filter(burst_size: usize, refill: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                burst_size,
                filter: Mutex::new(SpamFilter::new(burst_size, refill)),
                tx,
                rx: Mutex::new(Some(rx)),
                sinks: RwLock::new(Vec::new()),
                suppressed: AtomicU64::new(0),
            }),
        }
    }

    /// Configured burst size.
    pub fn burst_size(&self) -> usize {
        self.inner.burst_size
    }

    /// Adds a destination for events.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Number of events dropped by the spam filter.
    pub fn suppressed(&self) -> u64 {
        self.inner.suppressed.load(Ordering::Relaxed)
    }

    /// Returns a recorder that stamps events with `source`.
    pub fn recorder_for(&self, source: &str) -> EventRecorder {
        EventRecorder {
            source: source.to_string(),
            inner: self.inner.clone(),
        }
    }

    /// Starts delivering queued events to the sinks.
    ///
    /// Returns `None` if delivery was already started. Events still queued
    /// when `cancel` fires are delivered before the task exits.
    pub fn start(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self
            .inner
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let inner = self.inner.clone();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => deliver(&inner, &event).await,
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        while let Ok(event) = rx.try_recv() {
                            deliver(&inner, &event).await;
                        }
                        break;
                    }
                }
            }
            tracing::debug!("event broadcaster stopped");
        }))
    }
}

async fn deliver(inner: &Inner, event: &Event) {
    let sinks = inner
        .sinks
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for sink in sinks {
        sink.publish(event).await;
    }
}

/// Emits events on behalf of one component.
#[derive(Clone)]
pub struct EventRecorder {
    source: String,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("source", &self.source)
            .finish()
    }
}

impl EventRecorder {
    /// Component name stamped on events.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Queues an event. Returns false if the spam filter dropped it.
    pub fn event(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: impl Into<String>,
    ) -> bool {
        let key = spam_key(&self.source, object);
        let allowed = self
            .inner
            .filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allow(&key, Instant::now());

        if !allowed {
            self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, reason, "event suppressed by spam filter");
            return false;
        }

        let event = Event {
            source: self.source.clone(),
            involved_object: object.clone(),
            type_,
            reason: reason.to_string(),
            message: message.into(),
        };
        if self.inner.tx.send(event).is_err() {
            tracing::debug!(reason, "event broadcaster is closed, dropping event");
        }
        true
    }
}

/// Process-wide access to the manager's recorder.
///
/// Initialized exactly once during startup; until then events are dropped.
#[derive(Debug, Default)]
pub struct EventRecorderFacade {
    recorder: OnceLock<EventRecorder>,
}

impl EventRecorderFacade {
    /// Creates an uninitialized facade.
    pub const fn new() -> Self {
        Self {
            recorder: OnceLock::new(),
        }
    }

    /// Installs the recorder. Fails on the second call.
    pub fn init_from_recorder(&self, recorder: EventRecorder) -> Result<(), RecordError> {
        self.recorder
            .set(recorder)
            .map_err(|_| RecordError::AlreadyInitialized)
    }

    /// Returns true once a recorder is installed.
    pub fn is_initialized(&self) -> bool {
        self.recorder.get().is_some()
    }

    /// Returns the installed recorder.
    pub fn recorder(&self) -> Option<&EventRecorder> {
        self.recorder.get()
    }

    /// Emits a normal event.
    pub fn event(&self, object: &ObjectReference, reason: &str, message: impl Into<String>) {
        self.emit(object, EventType::Normal, reason, message.into());
    }

    /// Emits a warning event.
    pub fn warn(&self, object: &ObjectReference, reason: &str, message: impl Into<String>) {
        self.emit(object, EventType::Warning, reason, message.into());
    }

    fn emit(&self, object: &ObjectReference, type_: EventType, reason: &str, message: String) {
        match self.recorder.get() {
            Some(recorder) => {
                recorder.event(object, type_, reason, message);
            }
            None => tracing::debug!(reason, "event recorder not initialized, dropping event"),
        }
    }
}

/// Returns the process-wide facade used by the binary.
pub fn global() -> Arc<EventRecorderFacade> {
    static GLOBAL: OnceLock<Arc<EventRecorderFacade>> = OnceLock::new();
    GLOBAL
        .get_or_init(|| Arc::new(EventRecorderFacade::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct CaptureSink {
        events: AsyncMutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventSink for CaptureSink {
        async fn publish(&self, event: &Event) {
            self.events.lock().await.push(event.clone());
        }
    }

    fn control_plane(name: &str) -> ObjectReference {
        let gvk = GroupVersionKind::gvk(
            "controlplane.cluster.x-k8s.io",
            "v1alpha4",
            "AWSManagedControlPlane",
        );
        object_reference(&gvk, "default", name)
    }

    #[test]
    fn test_spam_filter_burst_and_refill() {
        let mut filter = SpamFilter::new(3, Duration::from_secs(10));
        let start = Instant::now();

        for _ in 0..3 {
            assert!(filter.allow("a", start));
        }
        assert!(!filter.allow("a", start));
        // other keys have their own bucket
        assert!(filter.allow("b", start));

        assert!(filter.allow("a", start + Duration::from_secs(10)));
        assert!(!filter.allow("a", start + Duration::from_secs(10)));
    }

    #[test]
    fn test_spam_filter_is_bounded() {
        let mut filter = SpamFilter::new(EVENT_BURST_SIZE, Duration::from_secs(10));
        let start = Instant::now();

        for i in 0..MAX_SPAM_KEYS * 2 {
            assert!(filter.allow(&format!("object-{i}"), start));
        }
        assert_eq!(filter.len(), MAX_SPAM_KEYS);
    }

    #[test]
    fn test_spam_filter_evicts_refilled_before_exhausted() {
        let mut filter = SpamFilter::with_capacity(2, Duration::from_secs(10), 2);
        let start = Instant::now();

        assert!(filter.allow("noisy", start));
        assert!(filter.allow("noisy", start));
        assert!(!filter.allow("noisy", start));
        assert!(filter.allow("quiet", start));

        // "quiet" has refilled by now, so it makes room instead of "noisy"
        let later = start + Duration::from_secs(10);
        assert!(filter.allow("new", later));
        assert_eq!(filter.len(), 2);
        assert!(filter.allow("noisy", later));
        assert!(!filter.allow("noisy", later));
    }

    #[test]
    fn test_broadcaster_accepts_full_burst() {
        let broadcaster = EventBroadcaster::with_burst_size(EVENT_BURST_SIZE);
        let recorder = broadcaster.recorder_for("aws-controller");
        let object = control_plane("cp-1");

        for i in 0..EVENT_BURST_SIZE {
            assert!(
                recorder.event(&object, EventType::Normal, "Reconciled", format!("event {i}")),
                "event {i} was suppressed"
            );
        }
        assert!(!recorder.event(&object, EventType::Normal, "Reconciled", "one too many"));
        assert_eq!(broadcaster.suppressed(), 1);

        // a different object is unaffected
        assert!(recorder.event(&control_plane("cp-2"), EventType::Normal, "Reconciled", "ok"));
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_to_sinks() {
        let broadcaster = EventBroadcaster::with_burst_size(EVENT_BURST_SIZE);
        let sink = Arc::new(CaptureSink::default());
        broadcaster.add_sink(sink.clone());
        broadcaster.add_sink(Arc::new(LogSink));

        let cancel = CancellationToken::new();
        let handle = broadcaster.start(cancel.clone()).unwrap();
        assert!(broadcaster.start(cancel.clone()).is_none());

        let recorder = broadcaster.recorder_for("aws-controller");
        recorder.event(&control_plane("cp-1"), EventType::Warning, "FailedCreate", "boom");

        cancel.cancel();
        handle.await.unwrap();

        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "aws-controller");
        assert_eq!(events[0].type_, EventType::Warning);
        assert_eq!(events[0].reason, "FailedCreate");
        assert_eq!(events[0].involved_object.name.as_deref(), Some("cp-1"));
    }

    #[test]
    fn test_facade_initializes_once() {
        let broadcaster = EventBroadcaster::with_burst_size(EVENT_BURST_SIZE);
        let facade = EventRecorderFacade::new();
        assert!(!facade.is_initialized());

        // dropped silently before initialization
        facade.event(&control_plane("cp-1"), "Reconciled", "ignored");

        facade
            .init_from_recorder(broadcaster.recorder_for("aws-controller"))
            .unwrap();
        assert!(facade.is_initialized());
        assert!(matches!(
            facade.init_from_recorder(broadcaster.recorder_for("other")),
            Err(RecordError::AlreadyInitialized)
        ));
        assert_eq!(facade.recorder().unwrap().source(), "aws-controller");
    }

    #[test]
    fn test_object_reference() {
        let reference = control_plane("cp-1");
        assert_eq!(
            reference.api_version.as_deref(),
            Some("controlplane.cluster.x-k8s.io/v1alpha4")
        );
        assert_eq!(reference.kind.as_deref(), Some("AWSManagedControlPlane"));
        assert_eq!(reference.namespace.as_deref(), Some("default"));
    }
}
