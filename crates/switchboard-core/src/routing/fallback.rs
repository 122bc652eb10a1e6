//! Ordered fallback execution
//!
//! Backends are tried strictly one at a time in the order given. The first
//! success ends the run. Each failure is classified, reported and absorbed.
//! Only exhaustion of the attempt budget surfaces, as one canonical error
//! carrying the last failure's code.

use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::types::BackendDescriptor;
use crate::classify::{BackendError, classify, safe_message};
use crate::error::{CanonicalError, ErrorCode};
use crate::observability::{Event, ObservabilityBus};

/// Operation label attached to fallback events
pub const DEFAULT_OP: &str = "run";

/// Message of the error raised when every attempt failed
pub const EXHAUSTED_MESSAGE: &str = "All backends failed (fallback exhausted)";

/// One failed attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptFailure {
    pub backend_id: String,
    /// 1-based attempt number
    pub attempt: usize,
    pub code: ErrorCode,
    pub latency_ms: u64,
    /// Truncated failure message
    pub message: String,
}

/// Successful fallback run
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome {
    pub backend_used: String,
    pub output: serde_json::Value,
    /// 1-based attempt number that succeeded
    pub attempt: usize,
    pub latency_ms: u64,
    /// Attempts that failed before the success
    pub failures: Vec<AttemptFailure>,
}

/// Result of a run together with every failed attempt
#[derive(Debug, Clone)]
pub struct FallbackReport {
    pub outcome: Result<FallbackOutcome, CanonicalError>,
    pub failures: Vec<AttemptFailure>,
}

impl FallbackReport {
    pub fn into_result(self) -> Result<FallbackOutcome, CanonicalError> {
        self.outcome
    }
}

/// Sequential executor over a ranked backend list
#[derive(Debug, Clone)]
pub struct FallbackOrchestrator {
    bus: ObservabilityBus,
    op: String,
}

impl FallbackOrchestrator {
    pub fn new(bus: ObservabilityBus) -> Self {
        Self {
            bus,
            op: DEFAULT_OP.to_string(),
        }
    }

    /// Set the operation label reported in events
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = op.into();
        self
    }

    /// Run backends in order until one succeeds
    ///
    /// At most `attempt_limit` backends are tried (all of them when `None` or
    /// zero).
    pub async fn execute(
        &self,
        ranked: &[BackendDescriptor],
        args: &serde_json::Value,
        request_id: &str,
        attempt_limit: Option<usize>,
    ) -> Result<FallbackOutcome, CanonicalError> {
        self.execute_detailed(ranked, args, request_id, attempt_limit)
            .await
            .into_result()
    }

    /// Like [`execute`](Self::execute), also returning every failed attempt
    pub async fn execute_detailed(
        &self,
        ranked: &[BackendDescriptor],
        args: &serde_json::Value,
        request_id: &str,
        attempt_limit: Option<usize>,
    ) -> FallbackReport {
        if ranked.is_empty() {
            return FallbackReport {
                outcome: Err(CanonicalError::new(
                    ErrorCode::ModelFailed,
                    "No backends supplied to fallback orchestrator",
                )),
                failures: Vec::new(),
            };
        }

        let budget = match attempt_limit {
            Some(limit) if limit > 0 => limit.min(ranked.len()),
            _ => ranked.len(),
        };
        let mut failures: Vec<AttemptFailure> = Vec::with_capacity(budget);

        for (index, backend) in ranked.iter().take(budget).enumerate() {
            let attempt = index + 1;
            debug!(request_id = %request_id, backend_id = %backend.id, attempt, "Attempting backend");
            self.bus.publish(Event::FallbackAttempt {
                request_id: request_id.to_string(),
                backend_id: backend.id.clone(),
                attempt,
                op: self.op.clone(),
            });

            let started = Instant::now();
            let result = match backend.runner() {
                Some(runner) => runner.run(args).await,
                None => Err(BackendError::canonical(
                    ErrorCode::ModelFailed,
                    format!("Backend {} has no runner", backend.id),
                )),
            };
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(output) => {
                    info!(
                        request_id = %request_id,
                        backend_id = %backend.id,
                        attempt,
                        latency_ms,
                        "Backend succeeded"
                    );
                    self.bus.publish(Event::FallbackSucceeded {
                        request_id: request_id.to_string(),
                        backend_id: backend.id.clone(),
                        attempt,
                        op: self.op.clone(),
                        latency_ms,
                    });
                    return FallbackReport {
                        outcome: Ok(FallbackOutcome {
                            backend_used: backend.id.clone(),
                            output,
                            attempt,
                            latency_ms,
                            failures: failures.clone(),
                        }),
                        failures,
                    };
                }
                Err(err) => {
                    let code = classify(Some(&err)).unwrap_or(ErrorCode::ModelFailed);
                    let message = safe_message(&err);
                    warn!(
                        request_id = %request_id,
                        backend_id = %backend.id,
                        attempt,
                        latency_ms,
                        code = %code,
                        error = %message,
                        "Backend failed, trying next"
                    );
                    self.bus.publish(Event::FallbackFailed {
                        request_id: request_id.to_string(),
                        backend_id: backend.id.clone(),
                        attempt,
                        op: self.op.clone(),
                        latency_ms,
                        error_code: code,
                        status: "error".to_string(),
                        message: message.clone(),
                    });
                    failures.push(AttemptFailure {
                        backend_id: backend.id.clone(),
                        attempt,
                        code,
                        latency_ms,
                        message,
                    });
                }
            }
        }

        let last = failures.last();
        let code = last.map_or(ErrorCode::ModelFailed, |f| f.code);
        let error = CanonicalError::new(code, EXHAUSTED_MESSAGE).with_meta(json!({
            "requestId": request_id,
            "attempts": failures.len(),
            "cause": last.map(|f| f.message.clone()),
        }));
        warn!(request_id = %request_id, attempts = failures.len(), code = %code, "Fallback exhausted");

        FallbackReport {
            outcome: Err(error),
            failures,
        }
    }
}
