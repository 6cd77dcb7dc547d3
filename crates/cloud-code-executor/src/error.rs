//! Error types raised out of the request executor.
//!
//! These map onto spec.md §6's error shapes; the HTTP layer is responsible
//! for translating them into status codes, the core never speaks HTTP
//! directly (spec §7).

/// Errors the executor can raise out of `execute()`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "RESOURCE_EXHAUSTED: Rate limited on {model}. Quota will reset after {wait_desc}. Next available: {next_available}"
    )]
    RateLimited {
        model: String,
        wait_desc: String,
        next_available: String,
    },

    #[error("AUTH_INVALID_PERMANENT: {0}")]
    AuthInvalidPermanent(String),

    #[error("Max retries exceeded")]
    MaxRetriesExceeded,

    #[error("No accounts available for {0}")]
    NoAccountsAvailable(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("pool error: {0}")]
    Pool(#[from] cloud_code_pool::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
