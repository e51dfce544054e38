use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::domain::backend::{BackendId, BackendRequest, BackendResponse};
use crate::orchestrator::{Backend, BackendCallError};

/// In-process backend serving a fixed JSON record. Useful for embedding the
/// gateway in front of local data and for exercising the pipeline in tests.
pub struct StaticBackend {
    id: BackendId,
    record: Map<String, Value>,
    field_scoping: bool,
    latency: Duration,
    timeout: Option<Duration>,
    failures: Mutex<VecDeque<BackendCallError>>,
    calls: AtomicU32,
    last_request: Mutex<Option<BackendRequest>>,
}

impl StaticBackend {
    /// `record` should be a JSON object; anything else serves an empty record.
    pub fn new(id: impl Into<String>, record: Value) -> Self {
        let record = match record {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: BackendId(id.into()),
            record,
            field_scoping: false,
            latency: Duration::ZERO,
            timeout: None,
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn with_field_scoping(mut self) -> Self {
        self.field_scoping = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Queues errors returned by the next calls, one per call.
    pub fn failing_with(self, failures: Vec<BackendCallError>) -> Self {
        match self.failures.lock() {
            Ok(mut queue) => queue.extend(failures),
            Err(poisoned) => poisoned.into_inner().extend(failures),
        }
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<BackendRequest> {
        match self.last_request.lock() {
            Ok(request) => request.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn next_failure(&self) -> Option<BackendCallError> {
        match self.failures.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

#[async_trait]
impl Backend for StaticBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn supports_field_scoping(&self) -> bool {
        self.field_scoping
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn call(&self, request: BackendRequest) -> Result<BackendResponse, BackendCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.last_request.lock() {
            Ok(mut last) => *last = Some(request.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(request.clone()),
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(failure) = self.next_failure() {
            return Err(failure);
        }

        let fields = match (&request.fields, self.field_scoping) {
            (Some(wanted), true) => self
                .record
                .iter()
                .filter(|(name, _)| wanted.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            _ => self.record.clone(),
        };
        Ok(BackendResponse { backend: self.id.clone(), fields, retrieved_at: Utc::now() })
    }
}
