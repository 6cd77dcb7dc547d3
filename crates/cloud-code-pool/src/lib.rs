//! Multi-account pool for the Cloud Code proxy
//!
//! Manages a set of accounts with per-model rate-limit tracking, a
//! pluggable selection strategy, and a background quota refresher. The
//! pool reads credentials from `cloud_code_auth::AccountStore` (single
//! source of truth) and maintains per-model/per-account runtime state
//! independently of it.
//!
//! Account lifecycle:
//! 1. Admin adds account via admin API → record stored, account enabled
//! 2. Executor selects an account for a model → pool checks/refreshes its
//!    token, returns it
//! 3. Upstream returns 429/503 → account rate-limited for that model until
//!    the computed backoff elapses
//! 4. Upstream returns a permanent-auth error → account marked invalid,
//!    excluded until the operator clears it
//! 5. Background task periodically refreshes subscription tier and
//!    per-model quota fractions

pub mod account;
pub mod classify;
pub mod error;
pub mod pool;
pub mod refresh;
pub mod strategy;

pub use account::{Account, Health, ModelRateLimit};
pub use classify::{AttemptClassification, BackoffErrorType, classify_attempt, classify_backoff_error_text};
pub use error::{Error, Result};
pub use pool::{NullProjectResolver, Pool, ProjectResolver};
pub use refresh::{NullQuotaProbe, ProbeResult, QuotaProbe, RefreshHandle, spawn_refresh_task};
pub use strategy::{LeastUsed, QuotaAware, RoundRobin, SelectOutcome, Sticky, Strategy, by_name};
