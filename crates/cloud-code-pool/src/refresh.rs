//! Quota Refresher (spec §4.4)
//!
//! Periodically sweeps every enabled account, asking a [`QuotaProbe`]
//! collaborator for the account's current subscription tier and per-model
//! quota fractions, then writes the result back through the pool (in-memory
//! and on disk). Runs independently of the request path; a slow or hanging
//! probe call on one account only delays that account's own staggered slot,
//! not the request path.
//!
//! A single `is_refreshing` flag prevents overlapping sweeps: if a sweep is
//! still running when the next tick fires, that tick is skipped rather than
//! queued.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cloud_code_auth::{ModelQuota, QuotaState, Subscription};
use tracing::{debug, warn};

use crate::account::now_ms;
use crate::pool::Pool;

/// Result of probing one account's subscription/quota state.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub tier: String,
    pub quotas: HashMap<String, ModelQuota>,
}

/// Fetches subscription tier and per-model quota for an account. The real
/// upstream endpoint for this is out of scope (spec.md §1); implementations
/// live in the binary crate.
pub trait QuotaProbe: Send + Sync {
    fn probe<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = crate::error::Result<ProbeResult>> + Send + 'a>>;
}

/// Probe that always reports an unknown tier with no quota data. Used when
/// no real probe is configured; the pool still functions, just without
/// quota-aware selection.
pub struct NullQuotaProbe;

impl QuotaProbe for NullQuotaProbe {
    fn probe<'a>(
        &'a self,
        _access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = crate::error::Result<ProbeResult>> + Send + 'a>> {
        Box::pin(async {
            Ok(ProbeResult {
                tier: "unknown".to_string(),
                quotas: HashMap::new(),
            })
        })
    }
}

/// Handle to a running background refresh task.
pub struct RefreshHandle {
    stop: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<()>,
}

impl RefreshHandle {
    /// Signal the task to stop after its current sweep (if any) finishes.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// Apply a probe result to one account: update in-memory state and persist
/// the slow-changing fields through the account store.
pub async fn apply_quota_refresh(pool: &Pool, email: &str, result: ProbeResult) {
    let now = now_ms();
    let existing_project_id = pool
        .store()
        .get(email)
        .await
        .and_then(|r| r.subscription.and_then(|s| s.project_id));

    let subscription = Subscription {
        tier: result.tier,
        project_id: existing_project_id,
        detected_at: now,
    };
    if let Err(e) = pool.store().set_subscription(email, subscription.clone()).await {
        warn!(email, error = %e, "failed to persist refreshed subscription");
    }
    pool.set_subscription_in_memory(email, subscription).await;

    let quota = QuotaState {
        models: result.quotas,
        last_checked: Some(now),
    };
    if let Err(e) = pool.store().set_quota(email, quota.clone()).await {
        warn!(email, error = %e, "failed to persist refreshed quota");
    }
    pool.set_quota_in_memory(email, quota).await;
}

/// Spawn the periodic refresh loop. `interval` is the sweep cadence (spec
/// default: 15 minutes); `stagger` is the delay between consecutive
/// accounts within a sweep (spec default: 2 seconds), so a pool of many
/// accounts doesn't fire a burst of concurrent upstream calls.
pub fn spawn_refresh_task(
    pool: Arc<Pool>,
    probe: Arc<dyn QuotaProbe>,
    interval: Duration,
    stagger: Duration,
) -> RefreshHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_task = stop.clone();
    let is_refreshing = Arc::new(AtomicBool::new(false));

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume the immediate first tick
        loop {
            ticker.tick().await;
            if stop_task.load(Ordering::SeqCst) {
                break;
            }
            run_sweep(&pool, &probe, stagger, &is_refreshing).await;
        }
    });

    RefreshHandle { stop, join }
}

async fn run_sweep(
    pool: &Pool,
    probe: &Arc<dyn QuotaProbe>,
    stagger: Duration,
    is_refreshing: &AtomicBool,
) {
    if is_refreshing.swap(true, Ordering::SeqCst) {
        debug!("quota refresh sweep already in progress, skipping this tick");
        return;
    }

    let accounts = pool.get_all_accounts().await;
    for account in accounts.into_iter().filter(|a| a.enabled && !a.is_invalid) {
        match pool.get_token_for_account(&account.email).await {
            Ok(token) => match probe.probe(&token).await {
                Ok(result) => apply_quota_refresh(pool, &account.email, result).await,
                Err(e) => warn!(email = %account.email, error = %e, "quota probe failed"),
            },
            Err(e) => {
                debug!(email = %account.email, error = %e, "skipping quota refresh, token unavailable")
            }
        }
        tokio::time::sleep(stagger).await;
    }

    is_refreshing.store(false, Ordering::SeqCst);
}
