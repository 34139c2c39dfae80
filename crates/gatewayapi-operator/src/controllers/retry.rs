//! Retry policy for route reconciliation
//!
//! Two layers of retry exist:
//! - [`retry_on_conflict`] re-runs a read-modify-write closure against a single
//!   route when the API reports an optimistic-concurrency conflict.
//! - [`compute_backoff`] decides when the controller redelivers a failed
//!   route, based on the error classification and [`RetryTracker`] count.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use kube::runtime::controller::Action;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::StoreError;

/// Maximum number of retries before giving up
const MAX_RETRIES: u32 = 10;

/// Base delay for exponential backoff (seconds)
const BASE_DELAY_SECS: u64 = 5;

/// Maximum delay between retries (1 hour)
const MAX_DELAY_SECS: u64 = 3600;

/// Tracks redelivery attempts per route
#[derive(Debug, Default)]
pub struct RetryTracker {
    /// Map of `namespace/name` to retry count
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        // Counters stay usable even if a holder panicked
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Increment retry count for a route and return the new count
    pub fn increment(&self, key: &str) -> u32 {
        let mut attempts = self.lock();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset retry count for a route (call on successful reconciliation)
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn get(&self, key: &str) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }
}

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient errors that should be retried with backoff
    /// Examples: API unavailability, write conflicts on a gateway
    Transient,
    /// Permanent errors that will not recover without intervention
    /// Examples: issuer/zone policy violations, malformed objects
    Permanent,
}

/// Determine the redelivery action based on error kind and attempt count
pub fn compute_backoff(attempt: u32, kind: ErrorKind) -> Action {
    match kind {
        ErrorKind::Transient => {
            if attempt >= MAX_RETRIES {
                warn!(
                    attempt,
                    max_retries = MAX_RETRIES,
                    "Max retries exceeded, waiting for resource change"
                );
                Action::await_change()
            } else {
                let delay_secs = backoff_delay_secs(attempt);
                debug!(
                    attempt,
                    delay_secs, "Scheduling retry with exponential backoff"
                );
                Action::requeue(Duration::from_secs(delay_secs))
            }
        }
        ErrorKind::Permanent => {
            warn!("Permanent error, waiting for resource change");
            Action::await_change()
        }
    }
}

/// 5s, 10s, 20s, 40s, ... capped at one hour
fn backoff_delay_secs(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(31);
    BASE_DELAY_SECS
        .saturating_mul(2u64.pow(exp))
        .min(MAX_DELAY_SECS)
}

/// Bound on local conflict retries against a single object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetry {
    attempts: u32,
    pause: Duration,
}

impl ConflictRetry {
    /// `attempts` is clamped to at least one
    pub fn new(attempts: u32, pause: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            pause,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Gave up after {attempts} conflicting attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// attempt bound is hit.
///
/// `op` must re-read the object on every call so each attempt works on the
/// latest resource version.
pub async fn retry_on_conflict<T, F, Fut>(policy: ConflictRetry, mut op: F) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() => {
                if attempt >= policy.attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                debug!(attempt, error = %e, "Write conflict, retrying");
                attempt += 1;
                if !policy.pause.is_zero() {
                    tokio::time::sleep(policy.pause).await;
                }
            }
            Err(e) => return Err(RetryError::Store(e)),
        }
    }
}
