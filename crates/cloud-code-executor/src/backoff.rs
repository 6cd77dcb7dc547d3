//! Smart backoff calculator and reset-time parser (spec.md §4.3)

use serde::Deserialize;

use cloud_code_pool::BackoffErrorType;

use crate::config::ExecutorConfig;

/// Fixed backoff per non-quota [`BackoffErrorType`] variant, configurable so
/// an operator can tune wait times without a rebuild.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffErrorTypeMs {
    pub rate_limit_exceeded_ms: u64,
    pub model_capacity_exhausted_ms: u64,
    pub server_error_ms: u64,
}

impl Default for BackoffErrorTypeMs {
    fn default() -> Self {
        Self {
            rate_limit_exceeded_ms: 30_000,
            model_capacity_exhausted_ms: 15_000,
            server_error_ms: 5_000,
        }
    }
}

/// `calculateSmartBackoff(errorText, resetMsFromServer, attempt)` — spec.md §4.3.
///
/// 1. A positive server-supplied reset always wins.
/// 2. Otherwise classify `error_text` and pick a tier/fixed wait.
/// 3. The result is never below `min_backoff_ms`.
pub fn calculate_smart_backoff(
    config: &ExecutorConfig,
    error_text: &str,
    reset_ms_from_server: Option<u64>,
    attempt: usize,
) -> u64 {
    if let Some(server_ms) = reset_ms_from_server
        && server_ms > 0
    {
        return server_ms.max(config.min_backoff_ms);
    }

    let classified = cloud_code_pool::classify_backoff_error_text(error_text);
    let computed = match classified {
        BackoffErrorType::QuotaExhausted => config.quota_backoff_ms(attempt),
        BackoffErrorType::RateLimitExceeded => config.backoff_by_error_type.rate_limit_exceeded_ms,
        BackoffErrorType::ModelCapacityExhausted => {
            config.backoff_by_error_type.model_capacity_exhausted_ms
        }
        BackoffErrorType::ServerError => config.backoff_by_error_type.server_error_ms,
        BackoffErrorType::Unknown => config.min_backoff_ms,
    };

    computed.max(config.min_backoff_ms)
}

/// `parseResetTime(response, text)` — spec.md §4.3.
///
/// Prefers the `Retry-After` header (seconds, integer), then a `retry after
/// Nm Ns` pattern in the body text, else `None`.
pub fn parse_reset_time_ms(retry_after_header: Option<&str>, body_text: &str) -> Option<u64> {
    if let Some(header) = retry_after_header
        && let Ok(seconds) = header.trim().parse::<u64>()
    {
        return Some(seconds * 1000);
    }
    parse_retry_after_from_text(body_text)
}

/// Matches `retry after 1m 30s`, `retry after 45s`, `retry after 2m`
/// (case-insensitive), returning total milliseconds.
fn parse_retry_after_from_text(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    let idx = lower.find("retry after")?;
    let rest = &lower[idx + "retry after".len()..];

    let mut minutes: u64 = 0;
    let mut seconds: u64 = 0;
    let mut found = false;

    let mut num = String::new();
    for ch in rest.chars() {
        if ch.is_ascii_digit() {
            num.push(ch);
        } else if ch == 'm' && !num.is_empty() {
            minutes = num.parse().unwrap_or(0);
            num.clear();
            found = true;
        } else if ch == 's' && !num.is_empty() {
            seconds = num.parse().unwrap_or(0);
            num.clear();
            found = true;
            break;
        } else if !num.is_empty() {
            // Any other separator after a bare number with no unit: stop.
            break;
        } else if ch.is_whitespace() {
            continue;
        } else {
            break;
        }
    }

    if found {
        Some((minutes * 60 + seconds) * 1000)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_reset_always_wins() {
        let cfg = ExecutorConfig::default();
        let wait = calculate_smart_backoff(&cfg, "quota exceeded 5-hour limit", Some(45_000), 0);
        assert_eq!(wait, 45_000);
    }

    #[test]
    fn quota_exhausted_uses_attempt_indexed_tier() {
        let cfg = ExecutorConfig::default();
        assert_eq!(
            calculate_smart_backoff(&cfg, "5-hour usage limit exceeded", None, 0),
            60_000
        );
        assert_eq!(
            calculate_smart_backoff(&cfg, "5-hour usage limit exceeded", None, 1),
            300_000
        );
    }

    #[test]
    fn rate_limit_uses_fixed_tier() {
        let cfg = ExecutorConfig::default();
        assert_eq!(
            calculate_smart_backoff(&cfg, "too many requests", None, 0),
            cfg.backoff_by_error_type.rate_limit_exceeded_ms
        );
    }

    #[test]
    fn unknown_falls_back_to_min_backoff() {
        let cfg = ExecutorConfig::default();
        assert_eq!(
            calculate_smart_backoff(&cfg, "teapot", None, 0),
            cfg.min_backoff_ms
        );
    }

    #[test]
    fn zero_server_reset_is_ignored() {
        let cfg = ExecutorConfig::default();
        let wait = calculate_smart_backoff(&cfg, "too many requests", Some(0), 0);
        assert_eq!(wait, cfg.backoff_by_error_type.rate_limit_exceeded_ms);
    }

    #[test]
    fn parse_reset_prefers_retry_after_header() {
        let wait = parse_reset_time_ms(Some("30"), "retry after 10m 0s");
        assert_eq!(wait, Some(30_000));
    }

    #[test]
    fn parse_reset_falls_back_to_body_text() {
        let wait = parse_reset_time_ms(None, "Please retry after 1m 30s and try again");
        assert_eq!(wait, Some(90_000));
    }

    #[test]
    fn parse_reset_handles_seconds_only() {
        let wait = parse_reset_time_ms(None, "retry after 45s");
        assert_eq!(wait, Some(45_000));
    }

    #[test]
    fn parse_reset_returns_none_when_absent() {
        let wait = parse_reset_time_ms(None, "no timing information here");
        assert_eq!(wait, None);
    }

    #[test]
    fn parse_reset_ignores_malformed_header() {
        let wait = parse_reset_time_ms(Some("not-a-number"), "retry after 5s");
        assert_eq!(wait, Some(5_000));
    }
}
