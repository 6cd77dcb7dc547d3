//! Runtime account state
//!
//! `Account` is the in-memory view the pool operates on. Slow-changing
//! fields (credentials, subscription, last-checked quota) are seeded from a
//! `cloud_code_auth::AccountRecord` at load time and written back through
//! the record store on significant change (token rotation, subscription
//! detection, quota refresh). Per-model rate limits and health counters are
//! transient: never persisted, rebuilt from nothing on restart.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use cloud_code_auth::{AccountRecord, AccountSource, QuotaState, Subscription};

/// Per-(account, model) transient rate-limit state.
#[derive(Debug, Clone)]
pub struct ModelRateLimit {
    pub is_rate_limited: bool,
    /// Unix timestamp (ms) this limit clears.
    pub reset_time_ms: u64,
    pub reason: Option<String>,
}

/// Health counters tracked per account, independent of any one model.
#[derive(Debug, Clone, Default)]
pub struct Health {
    pub consecutive_failures: u32,
    pub last_used_ms: Option<u64>,
    pub last_success_at_ms: Option<u64>,
}

/// In-memory runtime state for one pool account.
#[derive(Debug, Clone)]
pub struct Account {
    pub email: String,
    pub source: AccountSource,
    pub enabled: bool,
    pub is_invalid: bool,
    pub invalid_reason: Option<String>,
    pub subscription: Option<Subscription>,
    pub quota: QuotaState,
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
    pub health: Health,
}

impl Account {
    pub fn from_record(record: &AccountRecord) -> Self {
        Self {
            email: record.email.clone(),
            source: record.source,
            enabled: record.enabled,
            is_invalid: record.is_invalid,
            invalid_reason: record.invalid_reason.clone(),
            subscription: record.subscription.clone(),
            quota: record.quota.clone(),
            model_rate_limits: HashMap::new(),
            health: Health::default(),
        }
    }

    /// Availability invariant (spec §3): `enabled && !isInvalid &&
    /// (modelRateLimits[model] absent OR resetTime <= now)`.
    pub fn is_available_for(&self, model: &str, now_ms: u64) -> bool {
        if !self.enabled || self.is_invalid {
            return false;
        }
        match self.model_rate_limits.get(model) {
            Some(limit) => limit.reset_time_ms <= now_ms,
            None => true,
        }
    }

    /// Remove rate-limit entries whose reset time has passed. Idempotent:
    /// calling twice in a row is a no-op the second time.
    pub fn clear_expired_limits(&mut self, now_ms: u64) {
        self.model_rate_limits
            .retain(|_, limit| limit.reset_time_ms > now_ms);
    }

    /// Milliseconds until this account's rate limit for `model` clears, or
    /// `None` if it isn't currently limited.
    pub fn wait_time_ms(&self, model: &str, now_ms: u64) -> Option<u64> {
        self.model_rate_limits.get(model).and_then(|limit| {
            if limit.reset_time_ms > now_ms {
                Some(limit.reset_time_ms - now_ms)
            } else {
                None
            }
        })
    }
}

/// Current unix timestamp in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
