//! Executor tunables (spec.md §6)
//!
//! All knobs the retry/backoff state machine reads, collected into one
//! struct so the binary can load them from TOML (`services/cloud-code-proxy`
//! `config.rs`) instead of the values being hardcoded constants, following
//! the teacher's `default_timeout()` pattern.

use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffErrorTypeMs;

/// Tiered backoff in milliseconds for same-endpoint capacity retries.
/// Spec default: `[1_000, 5_000, 15_000]`.
fn default_capacity_backoff_tiers_ms() -> Vec<u64> {
    vec![1_000, 5_000, 15_000]
}

/// Tiered backoff in milliseconds for quota-exhausted smart backoff,
/// indexed by attempt number (clamped to the last tier).
/// Spec default: 60s, 5min, 15min, 30min.
fn default_quota_exhausted_backoff_tiers_ms() -> Vec<u64> {
    vec![60_000, 300_000, 900_000, 1_800_000]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Floor for `maxAttempts = max(MAX_RETRIES, accountCount + 1)`.
    pub max_retries: u32,
    /// Upper bound on same-request refetches when a streaming response
    /// produces zero content events.
    pub max_empty_response_retries: u32,
    /// Above this, the executor stops waiting on a shared rate limit and
    /// tries a fallback model (or fails) instead.
    pub max_wait_before_error_ms: u64,
    /// Consecutive non-rate-limit failures before an extended cooldown is
    /// imposed on an account.
    pub max_consecutive_failures: u32,
    /// Synthetic rate-limit duration applied after `max_consecutive_failures`.
    pub extended_cooldown_ms: u64,
    /// Same-endpoint retries allowed for capacity-marked 429/503 responses.
    pub max_capacity_retries: u32,
    /// Fallback same-endpoint delay when a capacity retry has no tier entry.
    pub capacity_retry_delay_ms: u64,
    pub capacity_backoff_tiers_ms: Vec<u64>,
    /// Per-attempt upstream call timeout.
    pub request_timeout_ms: u64,
    /// Additional ceiling applied only to non-streaming requests.
    pub non_streaming_timeout_ms: u64,
    pub quota_exhausted_backoff_tiers_ms: Vec<u64>,
    /// Fixed backoff per non-quota classified error type.
    pub backoff_by_error_type: BackoffErrorTypeMs,
    /// Floor under every computed backoff.
    pub min_backoff_ms: u64,
    /// Quota refresher sweep cadence.
    pub quota_refresh_interval_ms: u64,
    /// Delay between accounts within one refresher sweep.
    pub quota_stagger_delay_ms: u64,
    /// Selection strategy: "round_robin" | "sticky" | "least_used" | "quota_aware".
    pub strategy: String,
    /// Upper bound the host waits for in-flight streams to drain on shutdown.
    pub drain_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_empty_response_retries: 2,
            max_wait_before_error_ms: 120_000,
            max_consecutive_failures: 3,
            extended_cooldown_ms: 300_000,
            max_capacity_retries: 3,
            capacity_retry_delay_ms: 2_000,
            capacity_backoff_tiers_ms: default_capacity_backoff_tiers_ms(),
            request_timeout_ms: 60_000,
            non_streaming_timeout_ms: 300_000,
            quota_exhausted_backoff_tiers_ms: default_quota_exhausted_backoff_tiers_ms(),
            backoff_by_error_type: BackoffErrorTypeMs::default(),
            min_backoff_ms: 1_000,
            quota_refresh_interval_ms: 900_000,
            quota_stagger_delay_ms: 2_000,
            strategy: "round_robin".to_string(),
            drain_timeout_ms: 5_000,
        }
    }
}

impl ExecutorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn non_streaming_timeout(&self) -> Duration {
        Duration::from_millis(self.non_streaming_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// `max(MAX_RETRIES, accountCount + 1)` — spec.md §4.3.
    pub fn max_attempts(&self, account_count: usize) -> u32 {
        self.max_retries.max(account_count as u32 + 1)
    }

    pub fn capacity_backoff_ms(&self, retry_index: usize) -> u64 {
        self.capacity_backoff_tiers_ms
            .get(retry_index)
            .copied()
            .unwrap_or(self.capacity_retry_delay_ms)
    }

    pub fn quota_backoff_ms(&self, attempt: usize) -> u64 {
        let tiers = &self.quota_exhausted_backoff_tiers_ms;
        let idx = attempt.min(tiers.len().saturating_sub(1));
        tiers.get(idx).copied().unwrap_or(self.min_backoff_ms)
    }
}
