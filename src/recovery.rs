//! Failure classification, retry with backoff, and recovery statistics.
//!
//! Transient failures are retried with exponential backoff; non-retryable
//! errors propagate immediately without consuming retry budget. Outcomes are
//! recorded so operators can see how often retries actually rescue a run.

use crate::error::{ErrorKind, PipelineError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Verdict from [`ErrorRecoverySystem::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub kind: ErrorKind,
}

/// Retry knobs; see `PipelineConfig` for the configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `failed_attempts` failures.
    pub fn delay_for(&self, failed_attempts: usize) -> Duration {
        let exponent = failed_attempts.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis as u64)
    }
}

/// Recovery statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total: usize,
    pub resolved: usize,
    pub recovery_rate: f64,
    pub by_kind: HashMap<String, usize>,
}

#[derive(Default)]
struct RecoveryCounters {
    total: usize,
    resolved: usize,
    by_kind: HashMap<ErrorKind, usize>,
}

pub struct ErrorRecoverySystem {
    counters: RwLock<RecoveryCounters>,
}

impl ErrorRecoverySystem {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(RecoveryCounters::default()),
        }
    }

    pub fn classify(&self, error: &PipelineError) -> Classification {
        Classification {
            retryable: error.is_retryable(),
            kind: error.kind(),
        }
    }

    /// Run `op`, retrying transient failures with exponential backoff.
    ///
    /// Every failure is recorded; a success after one or more failures is
    /// recorded as a resolution of the last failure kind.
    pub async fn with_retry<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut last_kind: Option<ErrorKind> = None;

        for attempt in 1..=policy.max_attempts.max(1) {
            match op().await {
                Ok(value) => {
                    if let Some(kind) = last_kind {
                        self.record_outcome(kind, true);
                        debug!(kind = kind.as_str(), attempt, "operation recovered");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let classification = self.classify(&error);
                    if !classification.retryable {
                        self.record_outcome(classification.kind, false);
                        return Err(error);
                    }
                    last_kind = Some(classification.kind);
                    if attempt == policy.max_attempts.max(1) {
                        self.record_outcome(classification.kind, false);
                        warn!(
                            kind = classification.kind.as_str(),
                            attempts = attempt,
                            "retry budget exhausted"
                        );
                        return Err(error);
                    }
                    let delay = policy.delay_for(attempt);
                    debug!(
                        kind = classification.kind.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    pub fn record_outcome(&self, kind: ErrorKind, resolved: bool) {
        let mut counters = self.counters.write();
        counters.total += 1;
        if resolved {
            counters.resolved += 1;
        }
        *counters.by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn stats(&self) -> RecoveryStats {
        let counters = self.counters.read();
        let recovery_rate = if counters.total == 0 {
            0.0
        } else {
            counters.resolved as f64 / counters.total as f64
        };
        RecoveryStats {
            total: counters.total,
            resolved: counters.resolved,
            recovery_rate,
            by_kind: counters
                .by_kind
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
        }
    }
}

impl Default for ErrorRecoverySystem {
    fn default() -> Self {
        Self::new()
    }
}
