//! Selection strategies (spec §4.2)
//!
//! A strategy picks which account serves the next request for a given model.
//! All four variants share one tie-break rule: stable by the pool's insertion
//! order, which is why [`Strategy::select`] receives the full ordered account
//! slice rather than a pre-shuffled candidate set.
//!
//! Strategies are shared behind `Arc<dyn Strategy>` and called while the pool
//! holds its accounts lock, so any strategy-owned state (cursors, last-used
//! maps) uses interior mutability via atomics/mutexes rather than `&mut self`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::account::Account;

/// Result of one selection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOutcome {
    /// The chosen account's email, or `None` if the caller should wait.
    pub email: Option<String>,
    /// Milliseconds to wait before retrying, meaningful only when `email` is
    /// `None`.
    pub wait_ms: u64,
}

impl SelectOutcome {
    fn none(wait_ms: u64) -> Self {
        Self {
            email: None,
            wait_ms,
        }
    }

    fn some(email: String) -> Self {
        Self {
            email: Some(email),
            wait_ms: 0,
        }
    }
}

/// Polymorphic selection policy. Implementations must not block on I/O.
pub trait Strategy: Send + Sync {
    fn select(&self, accounts: &[Account], model: &str, now_ms: u64) -> SelectOutcome;
    fn notify_success(&self, email: &str, model: &str);
    fn notify_failure(&self, email: &str, model: &str);
    fn notify_rate_limit(&self, email: &str, model: &str);
    fn label(&self) -> &'static str;
}

/// Shortest wait among enabled, non-invalid accounts currently rate-limited
/// for `model`. `0` if at least one such account has no active limit.
fn min_wait_ms(accounts: &[Account], model: &str, now_ms: u64) -> u64 {
    let mut min: Option<u64> = None;
    for acct in accounts {
        if !acct.enabled || acct.is_invalid {
            continue;
        }
        match acct.wait_time_ms(model, now_ms) {
            Some(wait) => {
                min = Some(min.map_or(wait, |m: u64| m.min(wait)));
            }
            None => return 0,
        }
    }
    min.unwrap_or(0)
}

fn available_indices(accounts: &[Account], model: &str, now_ms: u64) -> Vec<usize> {
    accounts
        .iter()
        .enumerate()
        .filter(|(_, a)| a.is_available_for(model, now_ms))
        .map(|(i, _)| i)
        .collect()
}

/// Cycles a cursor over available accounts. Default strategy.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Strategy for RoundRobin {
    fn select(&self, accounts: &[Account], model: &str, now_ms: u64) -> SelectOutcome {
        let n = accounts.len();
        if n == 0 {
            return SelectOutcome::none(0);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if accounts[idx].is_available_for(model, now_ms) {
                return SelectOutcome::some(accounts[idx].email.clone());
            }
        }
        SelectOutcome::none(min_wait_ms(accounts, model, now_ms))
    }

    fn notify_success(&self, _email: &str, _model: &str) {}
    fn notify_failure(&self, _email: &str, _model: &str) {}
    fn notify_rate_limit(&self, _email: &str, _model: &str) {}

    fn label(&self) -> &'static str {
        "round_robin"
    }
}

/// Prefers the account that most recently succeeded on a given model,
/// falling back to round-robin when there is no sticky entry or it is no
/// longer available.
pub struct Sticky {
    last_used_for_model: Mutex<HashMap<String, String>>,
    fallback: RoundRobin,
}

impl Default for Sticky {
    fn default() -> Self {
        Self {
            last_used_for_model: Mutex::new(HashMap::new()),
            fallback: RoundRobin::default(),
        }
    }
}

impl Strategy for Sticky {
    fn select(&self, accounts: &[Account], model: &str, now_ms: u64) -> SelectOutcome {
        let sticky_email = self
            .last_used_for_model
            .lock()
            .unwrap()
            .get(model)
            .cloned();
        if let Some(email) = sticky_email
            && let Some(acct) = accounts.iter().find(|a| a.email == email)
            && acct.is_available_for(model, now_ms)
        {
            return SelectOutcome::some(email);
        }
        self.fallback.select(accounts, model, now_ms)
    }

    fn notify_success(&self, email: &str, model: &str) {
        self.last_used_for_model
            .lock()
            .unwrap()
            .insert(model.to_string(), email.to_string());
    }

    fn notify_failure(&self, _email: &str, _model: &str) {}
    fn notify_rate_limit(&self, _email: &str, _model: &str) {}

    fn label(&self) -> &'static str {
        "sticky"
    }
}

/// Picks the available account with the oldest `lastUsed` timestamp,
/// treating never-used (`None`) as oldest. Ties broken by insertion order.
pub struct LeastUsed;

impl Strategy for LeastUsed {
    fn select(&self, accounts: &[Account], model: &str, now_ms: u64) -> SelectOutcome {
        let indices = available_indices(accounts, model, now_ms);
        if indices.is_empty() {
            return SelectOutcome::none(min_wait_ms(accounts, model, now_ms));
        }
        let best = indices
            .into_iter()
            .min_by_key(|&i| accounts[i].health.last_used_ms.unwrap_or(0))
            .expect("non-empty");
        SelectOutcome::some(accounts[best].email.clone())
    }

    fn notify_success(&self, _email: &str, _model: &str) {}
    fn notify_failure(&self, _email: &str, _model: &str) {}
    fn notify_rate_limit(&self, _email: &str, _model: &str) {}

    fn label(&self) -> &'static str {
        "least_used"
    }
}

/// Picks the available account with the highest remaining-quota fraction for
/// the model, treating `None` as medium priority (0.5). Falls back to
/// least-used when every candidate's fraction is unknown.
pub struct QuotaAware;

impl Strategy for QuotaAware {
    fn select(&self, accounts: &[Account], model: &str, now_ms: u64) -> SelectOutcome {
        let indices = available_indices(accounts, model, now_ms);
        if indices.is_empty() {
            return SelectOutcome::none(min_wait_ms(accounts, model, now_ms));
        }

        let fraction_of = |i: usize| -> Option<f64> {
            accounts[i]
                .quota
                .models
                .get(model)
                .and_then(|q| q.remaining_fraction)
        };

        if indices.iter().all(|&i| fraction_of(i).is_none()) {
            return LeastUsed.select(accounts, model, now_ms);
        }

        let best = indices
            .into_iter()
            .max_by(|&a, &b| {
                let fa = fraction_of(a).unwrap_or(0.5);
                let fb = fraction_of(b).unwrap_or(0.5);
                fa.partial_cmp(&fb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("non-empty");
        SelectOutcome::some(accounts[best].email.clone())
    }

    fn notify_success(&self, _email: &str, _model: &str) {}
    fn notify_failure(&self, _email: &str, _model: &str) {}
    fn notify_rate_limit(&self, _email: &str, _model: &str) {}

    fn label(&self) -> &'static str {
        "quota_aware"
    }
}

/// Construct a strategy by its configured name, defaulting to round-robin.
pub fn by_name(name: &str) -> Box<dyn Strategy> {
    match name {
        "sticky" => Box::new(Sticky::default()),
        "least_used" => Box::new(LeastUsed),
        "quota_aware" => Box::new(QuotaAware),
        _ => Box::new(RoundRobin::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_code_auth::{AccountRecord, AccountSource, ModelQuota, QuotaState};

    fn record(email: &str) -> AccountRecord {
        AccountRecord {
            email: email.to_string(),
            source: AccountSource::Oauth,
            enabled: true,
            refresh_token: "rt".into(),
            access_token: "at".into(),
            expires: 0,
            project_id: None,
            added_at: 0,
            is_invalid: false,
            invalid_reason: None,
            last_used: None,
            subscription: None,
            quota: QuotaState::default(),
        }
    }

    fn accounts(emails: &[&str]) -> Vec<Account> {
        emails
            .iter()
            .map(|e| Account::from_record(&record(e)))
            .collect()
    }

    #[test]
    fn round_robin_is_a_permutation_across_n_selects() {
        let accts = accounts(&["a", "b", "c"]);
        let rr = RoundRobin::default();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let out = rr.select(&accts, "m", 0);
            seen.push(out.email.unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn round_robin_single_account_always_returns_it() {
        let accts = accounts(&["only"]);
        let rr = RoundRobin::default();
        for _ in 0..5 {
            assert_eq!(rr.select(&accts, "m", 0).email.as_deref(), Some("only"));
        }
    }

    #[test]
    fn round_robin_waits_when_all_rate_limited() {
        let mut accts = accounts(&["a"]);
        accts[0].model_rate_limits.insert(
            "m".into(),
            crate::account::ModelRateLimit {
                is_rate_limited: true,
                reset_time_ms: 5000,
                reason: None,
            },
        );
        let rr = RoundRobin::default();
        let out = rr.select(&accts, "m", 1000);
        assert!(out.email.is_none());
        assert_eq!(out.wait_ms, 4000);
    }

    #[test]
    fn sticky_prefers_last_successful_account() {
        let accts = accounts(&["a", "b"]);
        let sticky = Sticky::default();
        sticky.notify_success("b", "m");
        let out = sticky.select(&accts, "m", 0);
        assert_eq!(out.email.as_deref(), Some("b"));
    }

    #[test]
    fn sticky_falls_back_when_sticky_account_unavailable() {
        let mut accts = accounts(&["a", "b"]);
        accts[1].model_rate_limits.insert(
            "m".into(),
            crate::account::ModelRateLimit {
                is_rate_limited: true,
                reset_time_ms: 5000,
                reason: None,
            },
        );
        let sticky = Sticky::default();
        sticky.notify_success("b", "m");
        let out = sticky.select(&accts, "m", 1000);
        assert_eq!(out.email.as_deref(), Some("a"));
    }

    #[test]
    fn least_used_picks_oldest_last_used() {
        let mut accts = accounts(&["a", "b"]);
        accts[0].health.last_used_ms = Some(500);
        accts[1].health.last_used_ms = Some(100);
        let out = LeastUsed.select(&accts, "m", 0);
        assert_eq!(out.email.as_deref(), Some("b"));
    }

    #[test]
    fn least_used_treats_never_used_as_oldest() {
        let mut accts = accounts(&["a", "b"]);
        accts[0].health.last_used_ms = Some(100);
        accts[1].health.last_used_ms = None;
        let out = LeastUsed.select(&accts, "m", 0);
        assert_eq!(out.email.as_deref(), Some("b"));
    }

    #[test]
    fn least_used_ties_broken_by_insertion_order() {
        let mut accts = accounts(&["a", "b"]);
        accts[0].health.last_used_ms = Some(100);
        accts[1].health.last_used_ms = Some(100);
        let out = LeastUsed.select(&accts, "m", 0);
        assert_eq!(out.email.as_deref(), Some("a"));
    }

    #[test]
    fn quota_aware_picks_highest_remaining_fraction() {
        let mut accts = accounts(&["a", "b"]);
        accts[0].quota.models.insert(
            "m".into(),
            ModelQuota {
                remaining_fraction: Some(0.2),
                reset_at: None,
            },
        );
        accts[1].quota.models.insert(
            "m".into(),
            ModelQuota {
                remaining_fraction: Some(0.9),
                reset_at: None,
            },
        );
        let out = QuotaAware.select(&accts, "m", 0);
        assert_eq!(out.email.as_deref(), Some("b"));
    }

    #[test]
    fn quota_aware_falls_back_to_least_used_when_all_null() {
        let mut accts = accounts(&["a", "b"]);
        accts[0].health.last_used_ms = Some(500);
        accts[1].health.last_used_ms = Some(100);
        let out = QuotaAware.select(&accts, "m", 0);
        assert_eq!(out.email.as_deref(), Some("b"));
    }

    #[test]
    fn quota_aware_treats_null_as_medium_priority() {
        let mut accts = accounts(&["a", "b"]);
        accts[0].quota.models.insert(
            "m".into(),
            ModelQuota {
                remaining_fraction: Some(0.1),
                reset_at: None,
            },
        );
        // b has no entry at all -> treated as 0.5, beats a's 0.1
        let out = QuotaAware.select(&accts, "m", 0);
        assert_eq!(out.email.as_deref(), Some("b"));
    }

    #[test]
    fn by_name_defaults_to_round_robin() {
        assert_eq!(by_name("unknown").label(), "round_robin");
        assert_eq!(by_name("sticky").label(), "sticky");
        assert_eq!(by_name("least_used").label(), "least_used");
        assert_eq!(by_name("quota_aware").label(), "quota_aware");
    }
}
