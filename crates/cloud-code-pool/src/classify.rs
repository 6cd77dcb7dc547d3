//! Error classification for upstream responses
//!
//! Two classifiers live here, at different granularities:
//!
//! - [`classify_attempt`] — the per-endpoint-attempt classification table
//!   (spec's ATTEMPT state machine): distinguishes permanent vs transient
//!   auth failures, capacity overload vs rate-limit/quota exhaustion, and
//!   ordinary server/client errors. Consumed by the executor.
//! - [`classify_backoff_error_text`] — the coarser taxonomy the smart
//!   backoff calculator uses to pick a wait tier from response/body text
//!   alone, independent of HTTP status.
//!
//! Both work off substring markers rather than structured upstream error
//! codes, since the upstream error body shape is an external collaborator
//! out of this core's scope — only recognizable substrings are guaranteed.

/// Body markers indicating credentials are permanently rejected (not just
/// momentarily stale). Anything else on a 401 is treated as transient.
const PERMANENT_AUTH_MARKERS: &[&str] = &[
    "auth_invalid_permanent",
    "invalid_grant",
    "unauthorized_client",
    "account_deleted",
];

/// Body markers indicating short-lived upstream overload rather than quota
/// exhaustion. Distinguishing these matters: capacity errors are retried in
/// place at the same endpoint, quota errors switch accounts.
const CAPACITY_MARKERS: &[&str] = &[
    "model_capacity_exhausted",
    "resource exhausted: capacity",
    "overloaded",
];

/// Fine-grained classification of one upstream HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClassification {
    Success,
    /// 401 with a permanent-auth marker in the body.
    PermanentAuth,
    /// 401 without a permanent-auth marker — stale cached token/project.
    TransientAuth,
    /// 429/503 matching a capacity marker — retried in place.
    Capacity,
    /// 429/503 without a capacity marker — quota or rate-limit exhaustion.
    RateLimit,
    /// 5xx other than the capacity-marked 503 case.
    ServerError,
    /// Other 4xx (403, 404, ...).
    OtherClientError,
}

/// Classify one upstream response by HTTP status and body.
pub fn classify_attempt(status: u16, body: &str) -> AttemptClassification {
    match status {
        200..=299 => AttemptClassification::Success,
        401 => {
            if has_marker(body, PERMANENT_AUTH_MARKERS) {
                AttemptClassification::PermanentAuth
            } else {
                AttemptClassification::TransientAuth
            }
        }
        429 | 503 => {
            if has_marker(body, CAPACITY_MARKERS) {
                AttemptClassification::Capacity
            } else {
                AttemptClassification::RateLimit
            }
        }
        500 | 502 | 504 => AttemptClassification::ServerError,
        _ => AttemptClassification::OtherClientError,
    }
}

/// The coarse error-text taxonomy the smart backoff calculator classifies
/// into (spec §4.3 `calculateSmartBackoff`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffErrorType {
    QuotaExhausted,
    RateLimitExceeded,
    ModelCapacityExhausted,
    ServerError,
    Unknown,
}

/// Quota-exhaustion markers checked first: a 5-hour rolling subscription
/// limit, distinct from a plain per-minute rate limit.
const QUOTA_EXHAUSTED_PATTERNS: &[&str] = &[
    "5-hour",
    "5 hour",
    "rolling window",
    "usage limit for your plan",
    "subscription usage limit",
    "resource_exhausted",
    "quota",
];

const CAPACITY_PATTERNS: &[&str] = &["model_capacity_exhausted", "overloaded", "capacity"];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "rate_limit", "too many requests"];

const SERVER_ERROR_PATTERNS: &[&str] = &["internal error", "server error", "upstream error"];

/// Classify response/body text into the backoff taxonomy. Order matters:
/// quota markers are checked before the more generic capacity/rate-limit
/// patterns since upstream quota messages often also mention "limit".
pub fn classify_backoff_error_text(text: &str) -> BackoffErrorType {
    let lower = text.to_lowercase();
    if has_marker(&lower, QUOTA_EXHAUSTED_PATTERNS) {
        BackoffErrorType::QuotaExhausted
    } else if has_marker(&lower, CAPACITY_PATTERNS) {
        BackoffErrorType::ModelCapacityExhausted
    } else if has_marker(&lower, RATE_LIMIT_PATTERNS) {
        BackoffErrorType::RateLimitExceeded
    } else if has_marker(&lower, SERVER_ERROR_PATTERNS) {
        BackoffErrorType::ServerError
    } else {
        BackoffErrorType::Unknown
    }
}

fn has_marker(haystack: &str, markers: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}
