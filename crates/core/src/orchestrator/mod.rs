//! Concurrent, policy-scoped backend fan-out.

mod static_backend;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::domain::backend::{BackendId, BackendRequest, BackendResponse};
use crate::errors::BackendError;
use crate::policy::PolicyDecision;

pub use static_backend::StaticBackend;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendCallError {
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("permanent backend failure: {0}")]
    Permanent(String),
    #[error("backend call timed out")]
    Timeout,
}

impl BackendCallError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }

    fn into_backend_error(self, backend: &BackendId) -> BackendError {
        match self {
            Self::Timeout => BackendError::Timeout { backend: backend.clone() },
            Self::Transient(message) | Self::Permanent(message) => {
                BackendError::Unavailable { backend: backend.clone(), message }
            }
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn id(&self) -> &BackendId;

    /// Whether the backend honours `BackendRequest::fields`.
    fn supports_field_scoping(&self) -> bool {
        false
    }

    /// Per-backend timeout; the orchestrator default applies when `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn call(&self, request: BackendRequest) -> Result<BackendResponse, BackendCallError>;
}

#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendId, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.id().clone(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, id: &BackendId) -> Option<Arc<dyn Backend>> {
        self.backends.get(id).cloned()
    }

    pub fn ids(&self) -> BTreeSet<BackendId> {
        self.backends.keys().cloned().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff with full jitter, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        let base = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let jittered_ms = rand::thread_rng().gen_range(base_ms / 2..=base_ms.max(1));
        Duration::from_millis(jittered_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourcedValue {
    pub field: String,
    pub source: BackendId,
    pub value: Value,
    pub retrieved_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendFailure {
    pub backend: BackendId,
    pub error: BackendError,
    pub attempts: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatedResult {
    pub values: Vec<SourcedValue>,
    pub succeeded: Vec<BackendId>,
    pub failed: Vec<BackendFailure>,
    pub deadline_expired: bool,
}

impl AggregatedResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// The request-level error, if any required backend failed.
    pub fn failure(&self) -> Option<BackendError> {
        let first = self.failed.first()?;
        let all_timed_out = self
            .failed
            .iter()
            .all(|failure| matches!(failure.error, BackendError::Timeout { .. }));
        if self.deadline_expired || all_timed_out {
            return Some(BackendError::Timeout { backend: first.backend.clone() });
        }
        if self.failed.len() == 1 && self.succeeded.is_empty() {
            return Some(first.error.clone());
        }
        Some(BackendError::PartialFailure {
            failed: self.failed.iter().map(|failure| failure.backend.clone()).collect(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Orchestrator {
    backend_timeout: Duration,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            backend_timeout: Duration::from_millis(config.backend_timeout_ms),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
                max_delay: Duration::from_millis(config.retry_max_delay_ms),
            },
        }
    }

    /// Calls every backend the decision needs, concurrently, until `deadline`.
    /// Backends are only asked for the fields the decision sources from them.
    pub async fn fetch(
        &self,
        request_id: &str,
        decision: &PolicyDecision,
        registry: &BackendRegistry,
        params: &BTreeMap<String, String>,
        deadline: Instant,
    ) -> AggregatedResult {
        let mut result = AggregatedResult::default();
        let mut pending: BTreeSet<BackendId> = BTreeSet::new();
        let mut join_set = JoinSet::new();

        for (backend_id, fields) in decision.required_backends() {
            let Some(backend) = registry.get(&backend_id) else {
                warn!(
                    event_name = "orchestrator.backend.unregistered",
                    correlation_id = request_id,
                    backend = %backend_id,
                    "decision references a backend that is not registered"
                );
                result.failed.push(BackendFailure {
                    error: BackendError::Unavailable {
                        backend: backend_id.clone(),
                        message: "backend not registered".to_owned(),
                    },
                    backend: backend_id,
                    attempts: 0,
                });
                continue;
            };

            let request = BackendRequest {
                request_id: request_id.to_owned(),
                backend: backend_id.clone(),
                fields: backend.supports_field_scoping().then_some(fields),
                params: params.clone(),
                issued_at: Utc::now(),
            };
            let timeout = backend.timeout().unwrap_or(self.backend_timeout);
            let retry = self.retry.clone();
            pending.insert(backend_id.clone());
            join_set.spawn(async move {
                let (outcome, attempts) =
                    call_with_retry(backend, request, timeout, retry, deadline).await;
                (backend_id, outcome, attempts)
            });
        }

        let collected = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((backend_id, outcome, attempts)) => {
                        pending.remove(&backend_id);
                        match outcome {
                            Ok(response) => {
                                debug!(
                                    correlation_id = request_id,
                                    backend = %backend_id,
                                    attempts,
                                    values = response.fields.len(),
                                    "backend call succeeded"
                                );
                                let retrieved_at = response.retrieved_at;
                                result.values.extend(response.fields.into_iter().map(
                                    |(field, value)| SourcedValue {
                                        field,
                                        source: backend_id.clone(),
                                        value,
                                        retrieved_at,
                                    },
                                ));
                                result.succeeded.push(backend_id);
                            }
                            Err(error) => {
                                warn!(
                                    event_name = "orchestrator.backend.failed",
                                    correlation_id = request_id,
                                    backend = %backend_id,
                                    attempts,
                                    error = %error,
                                    "backend call failed"
                                );
                                result.failed.push(BackendFailure {
                                    error: error.into_backend_error(&backend_id),
                                    backend: backend_id,
                                    attempts,
                                });
                            }
                        }
                    }
                    Err(join_error) => {
                        warn!(
                            correlation_id = request_id,
                            error = %join_error,
                            "backend task ended abnormally"
                        );
                    }
                }
            }
        })
        .await;

        if collected.is_err() {
            join_set.abort_all();
            result.deadline_expired = true;
            for backend_id in std::mem::take(&mut pending) {
                warn!(
                    event_name = "orchestrator.backend.deadline_exceeded",
                    correlation_id = request_id,
                    backend = %backend_id,
                    "request deadline reached before backend answered"
                );
                result.failed.push(BackendFailure {
                    error: BackendError::Timeout { backend: backend_id.clone() },
                    backend: backend_id,
                    attempts: 0,
                });
            }
        }

        for backend_id in pending {
            result.failed.push(BackendFailure {
                error: BackendError::Unavailable {
                    backend: backend_id.clone(),
                    message: "backend task aborted".to_owned(),
                },
                backend: backend_id,
                attempts: 0,
            });
        }

        result.succeeded.sort();
        result.failed.sort_by(|left, right| left.backend.cmp(&right.backend));
        result
    }
}

async fn call_with_retry(
    backend: Arc<dyn Backend>,
    request: BackendRequest,
    timeout: Duration,
    retry: RetryPolicy,
    deadline: Instant,
) -> (Result<BackendResponse, BackendCallError>, u32) {
    let mut attempts = 0_u32;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return (Err(BackendCallError::Timeout), attempts);
        }
        attempts += 1;

        let call = backend.call(request.clone());
        let outcome = match tokio::time::timeout(timeout.min(remaining), call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendCallError::Timeout),
        };

        match outcome {
            Ok(response) => return (Ok(response), attempts),
            Err(error) if error.is_retryable() && attempts <= retry.max_retries => {
                let backoff = retry.delay_for(attempts - 1);
                if Instant::now() + backoff >= deadline {
                    return (Err(error), attempts);
                }
                warn!(
                    correlation_id = %request.request_id,
                    backend = %request.backend,
                    error = %error,
                    retry = attempts,
                    max_retries = retry.max_retries,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "retrying backend call"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(error) => return (Err(error), attempts),
        }
    }
}
