//! Account Pool (spec §4.1)
//!
//! Owns the ordered, in-memory view of every configured account and is the
//! only thing in the process allowed to mutate account state. Credentials
//! and the slow-changing fields (subscription, last-checked quota) are
//! persisted through `cloud_code_auth::AccountStore`; per-model rate limits
//! and health counters are transient and live only in `accounts`.
//!
//! Selection is a compound operation — clear expired limits, then ask the
//! strategy to pick — and must appear atomic to concurrent callers. Both
//! steps run while holding a single write lock on `accounts`, and neither
//! step performs I/O.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cloud_code_auth::{AccountRecord, AccountStore, Subscription};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::account::{Account, ModelRateLimit, now_ms};
use crate::error::{Error, Result};
use crate::strategy::{SelectOutcome, Strategy};

/// Resolves the Cloud Code project id for a freshly authorized account.
/// Project discovery itself is an external collaborator (spec.md §6); this
/// seam lets the binary plug in a real implementation while tests use
/// [`NullProjectResolver`] or a fixed-answer stub.
pub trait ProjectResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

/// Default resolver: always fails. Forces callers to either pre-populate
/// `project_id` on the account record or supply a real resolver.
pub struct NullProjectResolver;

impl ProjectResolver for NullProjectResolver {
    fn resolve<'a>(
        &'a self,
        _access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async { Err(Error::ProjectDiscovery("no project resolver configured".into())) })
    }
}

/// The Account Pool: ordered account list, backing store, selection
/// strategy, and the shared HTTP client used for token refresh.
pub struct Pool {
    accounts: RwLock<Vec<Account>>,
    store: Arc<AccountStore>,
    strategy: Box<dyn Strategy>,
    project_resolver: Box<dyn ProjectResolver>,
    http_client: reqwest::Client,
    token_refresh_skew_ms: u64,
}

impl Pool {
    /// Build a pool from already-loaded records. `records` order becomes the
    /// pool's stable insertion order, so callers should sort by `added_at`
    /// before calling this (as `AccountStore::all` makes no ordering
    /// guarantee of its own).
    pub fn new(
        records: Vec<AccountRecord>,
        store: Arc<AccountStore>,
        strategy: Box<dyn Strategy>,
        http_client: reqwest::Client,
    ) -> Self {
        let accounts = records.iter().map(Account::from_record).collect();
        Self {
            accounts: RwLock::new(accounts),
            store,
            strategy,
            project_resolver: Box::new(NullProjectResolver),
            http_client,
            token_refresh_skew_ms: cloud_code_auth::TOKEN_REFRESH_SKEW_SECS * 1000,
        }
    }

    pub fn with_project_resolver(mut self, resolver: Box<dyn ProjectResolver>) -> Self {
        self.project_resolver = resolver;
        self
    }

    pub fn store(&self) -> &Arc<AccountStore> {
        &self.store
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn strategy_label(&self) -> &'static str {
        self.strategy.label()
    }

    pub async fn get_all_accounts(&self) -> Vec<Account> {
        self.accounts.read().await.clone()
    }

    pub async fn get_account_count(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn get_available_accounts(&self, model: &str) -> Vec<Account> {
        let now = now_ms();
        let mut accounts = self.accounts.write().await;
        for acct in accounts.iter_mut() {
            acct.clear_expired_limits(now);
        }
        accounts
            .iter()
            .filter(|a| a.is_available_for(model, now))
            .cloned()
            .collect()
    }

    /// `true` when every enabled, non-invalid account is currently
    /// rate-limited for `model`. `false` on an empty pool — there is nothing
    /// to wait on, the caller should fail fast with `PoolExhausted` instead.
    pub async fn is_all_rate_limited(&self, model: &str) -> bool {
        let now = now_ms();
        let mut accounts = self.accounts.write().await;
        for acct in accounts.iter_mut() {
            acct.clear_expired_limits(now);
        }
        let candidates: Vec<_> = accounts.iter().filter(|a| a.enabled && !a.is_invalid).collect();
        if candidates.is_empty() {
            return false;
        }
        candidates.iter().all(|a| !a.is_available_for(model, now))
    }

    /// Shortest wait, in milliseconds, until some enabled non-invalid
    /// account becomes available for `model`. `0` if one already is.
    pub async fn get_min_wait_time_ms(&self, model: &str) -> u64 {
        let now = now_ms();
        let accounts = self.accounts.read().await;
        let mut min: Option<u64> = None;
        for acct in accounts.iter() {
            if !acct.enabled || acct.is_invalid {
                continue;
            }
            match acct.wait_time_ms(model, now) {
                Some(wait) => min = Some(min.map_or(wait, |m: u64| m.min(wait))),
                None => return 0,
            }
        }
        min.unwrap_or(0)
    }

    /// Drop every account's rate-limit state. Used when the operator wants
    /// to force a clean retry pass (e.g. after raising a subscription tier).
    pub async fn reset_all_rate_limits(&self) {
        let mut accounts = self.accounts.write().await;
        for acct in accounts.iter_mut() {
            acct.model_rate_limits.clear();
        }
    }

    /// Atomically clear expired limits, then hand the resulting view to the
    /// selection strategy.
    pub async fn select_account(&self, model: &str) -> SelectOutcome {
        let now = now_ms();
        let mut accounts = self.accounts.write().await;
        for acct in accounts.iter_mut() {
            acct.clear_expired_limits(now);
        }
        self.strategy.select(&accounts, model, now)
    }

    pub async fn mark_rate_limited(&self, email: &str, model: &str, wait_ms: u64, reason: Option<String>) {
        let now = now_ms();
        let mut accounts = self.accounts.write().await;
        if let Some(acct) = accounts.iter_mut().find(|a| a.email == email) {
            acct.model_rate_limits.insert(
                model.to_string(),
                ModelRateLimit {
                    is_rate_limited: true,
                    reset_time_ms: now + wait_ms,
                    reason,
                },
            );
        }
        drop(accounts);
        self.strategy.notify_rate_limit(email, model);
    }

    /// Mark an account invalid, in-memory and on disk. Terminal until the
    /// operator clears it through the admin API.
    pub async fn mark_invalid(&self, email: &str, reason: String) -> Result<()> {
        {
            let mut accounts = self.accounts.write().await;
            if let Some(acct) = accounts.iter_mut().find(|a| a.email == email) {
                acct.is_invalid = true;
                acct.invalid_reason = Some(reason.clone());
            } else {
                return Err(Error::NotFound(email.to_string()));
            }
        }
        self.store
            .mark_invalid(email, reason)
            .await
            .map_err(|e| Error::Record(e.to_string()))?;
        warn!(email, "account marked invalid");
        Ok(())
    }

    /// Operator-only recovery: clear the invalid flag in memory and on disk.
    pub async fn clear_invalid(&self, email: &str) -> Result<()> {
        {
            let mut accounts = self.accounts.write().await;
            let acct = accounts
                .iter_mut()
                .find(|a| a.email == email)
                .ok_or_else(|| Error::NotFound(email.to_string()))?;
            acct.is_invalid = false;
            acct.invalid_reason = None;
        }
        self.store
            .clear_invalid(email)
            .await
            .map_err(|e| Error::Record(e.to_string()))?;
        info!(email, "account invalid flag cleared");
        Ok(())
    }

    /// Returns the account's new consecutive-failure count.
    pub async fn notify_failure(&self, email: &str, model: &str) -> u32 {
        let mut accounts = self.accounts.write().await;
        let count = if let Some(acct) = accounts.iter_mut().find(|a| a.email == email) {
            acct.health.consecutive_failures += 1;
            acct.health.last_used_ms = Some(now_ms());
            acct.health.consecutive_failures
        } else {
            0
        };
        drop(accounts);
        self.strategy.notify_failure(email, model);
        count
    }

    pub async fn notify_success(&self, email: &str, model: &str) {
        let now = now_ms();
        {
            let mut accounts = self.accounts.write().await;
            if let Some(acct) = accounts.iter_mut().find(|a| a.email == email) {
                acct.health.consecutive_failures = 0;
                acct.health.last_used_ms = Some(now);
                acct.health.last_success_at_ms = Some(now);
            }
        }
        self.strategy.notify_success(email, model);
        if let Err(e) = self.store.touch_last_used(email, now).await {
            debug!(email, error = %e, "failed to persist last_used timestamp");
        }
    }

    pub async fn notify_rate_limit(&self, email: &str, model: &str) {
        self.strategy.notify_rate_limit(email, model);
    }

    /// Current access token for `email`, refreshing through the token
    /// endpoint when it is within the refresh skew of expiring.
    pub async fn get_token_for_account(&self, email: &str) -> Result<String> {
        let record = self
            .store
            .get(email)
            .await
            .ok_or_else(|| Error::NotFound(email.to_string()))?;

        let now = now_ms();
        if record.expires > now + self.token_refresh_skew_ms {
            return Ok(record.access_token);
        }

        debug!(email, "access token near expiry, refreshing");
        match cloud_code_auth::refresh_token(&self.http_client, &record.refresh_token).await {
            Ok(token) => {
                let expires = now + token.expires_in * 1000;
                let refresh_token = token.refresh_token.unwrap_or(record.refresh_token);
                self.store
                    .update_token(email, token.access_token.clone(), refresh_token, expires)
                    .await
                    .map_err(|e| Error::Record(e.to_string()))?;
                Ok(token.access_token)
            }
            Err(cloud_code_auth::Error::InvalidCredentials(reason)) => {
                self.mark_invalid(email, reason.clone()).await?;
                Err(Error::RefreshFailed(reason))
            }
            Err(e) => Err(Error::RefreshFailed(e.to_string())),
        }
    }

    /// Resolved Cloud Code project id for `email`, discovering and caching
    /// it through the configured [`ProjectResolver`] on first use.
    pub async fn get_project_for_account(&self, email: &str, access_token: &str) -> Result<String> {
        let record = self
            .store
            .get(email)
            .await
            .ok_or_else(|| Error::NotFound(email.to_string()))?;

        if let Some(project_id) = record.subscription.as_ref().and_then(|s| s.project_id.clone()) {
            return Ok(project_id);
        }

        let project_id = self.project_resolver.resolve(access_token).await?;
        let subscription = Subscription {
            tier: record
                .subscription
                .as_ref()
                .map(|s| s.tier.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            project_id: Some(project_id.clone()),
            detected_at: now_ms(),
        };
        self.store
            .set_subscription(email, subscription.clone())
            .await
            .map_err(|e| Error::Record(e.to_string()))?;

        let mut accounts = self.accounts.write().await;
        if let Some(acct) = accounts.iter_mut().find(|a| a.email == email) {
            acct.subscription = Some(subscription);
        }
        Ok(project_id)
    }

    /// Update an account's in-memory quota snapshot (spec §4.4: the
    /// refresher "updates the account" so quota-aware selection sees fresh
    /// fractions without waiting for a process restart to reload the store).
    pub async fn set_quota_in_memory(&self, email: &str, quota: cloud_code_auth::QuotaState) {
        let mut accounts = self.accounts.write().await;
        if let Some(acct) = accounts.iter_mut().find(|a| a.email == email) {
            acct.quota = quota;
        }
    }

    /// Update an account's in-memory subscription snapshot, mirroring a
    /// store write made outside `get_project_for_account` (e.g. the
    /// refresher's tier update).
    pub async fn set_subscription_in_memory(&self, email: &str, subscription: Subscription) {
        let mut accounts = self.accounts.write().await;
        if let Some(acct) = accounts.iter_mut().find(|a| a.email == email) {
            acct.subscription = Some(subscription);
        }
    }

    /// Force the next `get_token_for_account` call to refresh.
    pub async fn clear_token_cache(&self, email: Option<&str>) -> Result<()> {
        match email {
            Some(email) => self
                .store
                .invalidate_token(email)
                .await
                .map_err(|e| Error::Record(e.to_string())),
            None => {
                for email in self.store.emails().await {
                    self.store
                        .invalidate_token(&email)
                        .await
                        .map_err(|e| Error::Record(e.to_string()))?;
                }
                Ok(())
            }
        }
    }

    /// Force the next `get_project_for_account` call to rediscover.
    pub async fn clear_project_cache(&self, email: Option<&str>) -> Result<()> {
        match email {
            Some(email) => {
                self.store
                    .clear_project(email)
                    .await
                    .map_err(|e| Error::Record(e.to_string()))?;
                let mut accounts = self.accounts.write().await;
                if let Some(acct) = accounts.iter_mut().find(|a| a.email == email)
                    && let Some(sub) = acct.subscription.as_mut()
                {
                    sub.project_id = None;
                }
                Ok(())
            }
            None => {
                for email in self.store.emails().await {
                    self.clear_project_cache(Some(&email)).await?;
                }
                Ok(())
            }
        }
    }

    /// Add an account to the pool and persist it. Idempotent by email: a
    /// repeat add replaces the in-memory entry but keeps its position.
    pub async fn add_account(&self, record: AccountRecord) -> Result<()> {
        self.store
            .add(record.clone())
            .await
            .map_err(|e| Error::Record(e.to_string()))?;
        let mut accounts = self.accounts.write().await;
        let new_account = Account::from_record(&record);
        if let Some(existing) = accounts.iter_mut().find(|a| a.email == record.email) {
            *existing = new_account;
        } else {
            accounts.push(new_account);
        }
        Ok(())
    }

    pub async fn remove_account(&self, email: &str) -> Result<()> {
        self.store
            .remove(email)
            .await
            .map_err(|e| Error::Record(e.to_string()))?;
        let mut accounts = self.accounts.write().await;
        accounts.retain(|a| a.email != email);
        Ok(())
    }

    /// JSON summary of pool-wide health, used by the health endpoint and
    /// the admin `/admin/pool` route.
    pub async fn health(&self) -> serde_json::Value {
        let accounts = self.accounts.read().await;
        let total = accounts.len();
        let enabled = accounts.iter().filter(|a| a.enabled && !a.is_invalid).count();
        let invalid = accounts.iter().filter(|a| a.is_invalid).count();
        let now = now_ms();
        let rate_limited = accounts
            .iter()
            .filter(|a| a.model_rate_limits.values().any(|l| l.reset_time_ms > now))
            .count();
        serde_json::json!({
            "total_accounts": total,
            "enabled_accounts": enabled,
            "invalid_accounts": invalid,
            "rate_limited_accounts": rate_limited,
            "strategy": self.strategy.label(),
            "healthy": enabled > 0,
        })
    }

    /// Every model the pool has seen rate-limit or quota activity for. Used
    /// to scope the per-model metrics gauges without a separate configured
    /// model list.
    pub async fn known_models(&self) -> Vec<String> {
        let accounts = self.accounts.read().await;
        let mut models = std::collections::BTreeSet::new();
        for account in accounts.iter() {
            models.extend(account.model_rate_limits.keys().cloned());
            models.extend(account.quota.models.keys().cloned());
        }
        models.into_iter().collect()
    }
}

/// Per-model rate-limit and health state exposed for metrics collection.
pub async fn per_model_counts(pool: &Pool, models: &[String]) -> HashMap<String, (usize, usize)> {
    let accounts = pool.get_all_accounts().await;
    let now = now_ms();
    let mut out = HashMap::new();
    for model in models {
        let available = accounts.iter().filter(|a| a.is_available_for(model, now)).count();
        let cooling = accounts
            .iter()
            .filter(|a| a.wait_time_ms(model, now).is_some())
            .count();
        out.insert(model.clone(), (available, cooling));
    }
    out
}
