//! Account record storage
//!
//! Manages a JSON file mapping account emails to their persisted state. All
//! writes use atomic temp-file + rename to prevent corruption on crash. A
//! tokio Mutex serializes concurrent writes from request-time refresh,
//! background refresh, and the admin API.
//!
//! The record file is the single source of truth for credentials and for
//! the slow-changing fields (subscription, last checked quota) that the
//! quota refresher writes back. Fast-changing per-request state — rate
//! limit windows, health counters — lives only in the pool's in-memory
//! state and is rebuilt on restart; it is deliberately not part of this
//! file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// How an account's credentials were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSource {
    /// Added through the PKCE browser flow.
    Oauth,
    /// Credentials supplied directly by the operator (e.g. a service
    /// account key or a pre-obtained refresh token).
    Manual,
}

/// Subscription tier detected for an account, used by quota-aware selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub tier: String,
    pub project_id: Option<String>,
    /// Unix timestamp (ms) the tier was last confirmed.
    pub detected_at: u64,
}

/// Last-known quota fraction for a single model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelQuota {
    /// Fraction of quota remaining, `0.0..=1.0`, if the upstream reports one.
    pub remaining_fraction: Option<f64>,
    /// Unix timestamp (ms) this model's quota window resets, if known.
    pub reset_at: Option<u64>,
}

/// Per-model quota snapshot, refreshed on a background cadence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaState {
    #[serde(default)]
    pub models: HashMap<String, ModelQuota>,
    /// Unix timestamp (ms) this snapshot was last refreshed.
    pub last_checked: Option<u64>,
}

/// A single account's persisted state.
///
/// `expires` is a unix timestamp in milliseconds (absolute, not a delta).
/// Computed at storage time from `TokenResponse.expires_in` (seconds delta)
/// plus the current time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Stable identifier; also the key in the backing map.
    pub email: String,
    pub source: AccountSource,
    pub enabled: bool,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: String,
    /// Current access token (Bearer token for API calls).
    pub access_token: String,
    /// Expiration as unix timestamp in milliseconds.
    pub expires: u64,
    /// Resolved Cloud Code project id, once known.
    pub project_id: Option<String>,
    /// Unix timestamp (ms) the account was added.
    pub added_at: u64,
    /// Set by the operator flow; only the operator flow can clear it.
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    /// Unix timestamp (ms) of the account's last successful use.
    #[serde(default)]
    pub last_used: Option<u64>,
    #[serde(default)]
    pub subscription: Option<Subscription>,
    #[serde(default)]
    pub quota: QuotaState,
}

/// Thread-safe account record file manager.
///
/// The Mutex serializes all writes. Reads acquire the lock briefly to clone
/// the in-memory state, so request-time reads don't block on background writes.
pub struct AccountStore {
    path: PathBuf,
    state: Mutex<HashMap<String, AccountRecord>>,
}

impl AccountStore {
    /// Load account records from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// accounts). The pool will report `unhealthy` until accounts are added
    /// via the admin API.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading account record file: {e}")))?;
            let records: HashMap<String, AccountRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::RecordParse(format!("parsing account record file: {e}")))?;
            info!(path = %path.display(), accounts = records.len(), "loaded account records");
            records
        } else {
            info!(path = %path.display(), "account record file not found, starting with empty store");
            let store = HashMap::new();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Persist the current in-memory state to disk.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        write_atomic(&self.path, &state).await
    }

    /// Get a clone of a specific account record.
    pub async fn get(&self, email: &str) -> Option<AccountRecord> {
        let state = self.state.lock().await;
        state.get(email).cloned()
    }

    /// List all account emails.
    pub async fn emails(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.keys().cloned().collect()
    }

    /// Snapshot of all account records, in no particular order.
    pub async fn all(&self) -> Vec<AccountRecord> {
        let state = self.state.lock().await;
        state.values().cloned().collect()
    }

    /// Add or replace an account record and persist to disk.
    pub async fn add(&self, record: AccountRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!(email = %record.email, "adding account record");
        state.insert(record.email.clone(), record);
        write_atomic(&self.path, &state).await
    }

    /// Remove an account record and persist to disk.
    ///
    /// Returns the removed record if it existed.
    pub async fn remove(&self, email: &str) -> Result<Option<AccountRecord>> {
        let mut state = self.state.lock().await;
        let removed = state.remove(email);
        if removed.is_some() {
            debug!(email, "removed account record");
            write_atomic(&self.path, &state).await?;
        }
        Ok(removed)
    }

    /// Update tokens for an existing account after a refresh.
    pub async fn update_token(
        &self,
        email: &str,
        access_token: String,
        refresh_token: String,
        expires: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(email)
            .ok_or_else(|| Error::NotFound(format!("account {email} not in record store")))?;
        record.access_token = access_token;
        record.refresh_token = refresh_token;
        record.expires = expires;
        debug!(email, "updated token");
        write_atomic(&self.path, &state).await
    }

    /// Mark an account invalid with a reason. Only the operator flow should
    /// clear this afterwards via [`AccountStore::clear_invalid`].
    pub async fn mark_invalid(&self, email: &str, reason: String) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(email)
            .ok_or_else(|| Error::NotFound(format!("account {email} not in record store")))?;
        record.is_invalid = true;
        record.invalid_reason = Some(reason);
        write_atomic(&self.path, &state).await
    }

    /// Clear an account's invalid flag (operator-only recovery path).
    pub async fn clear_invalid(&self, email: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(email)
            .ok_or_else(|| Error::NotFound(format!("account {email} not in record store")))?;
        record.is_invalid = false;
        record.invalid_reason = None;
        write_atomic(&self.path, &state).await
    }

    /// Record the subscription tier detected for an account.
    pub async fn set_subscription(&self, email: &str, subscription: Subscription) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(email)
            .ok_or_else(|| Error::NotFound(format!("account {email} not in record store")))?;
        record.subscription = Some(subscription);
        write_atomic(&self.path, &state).await
    }

    /// Record a refreshed quota snapshot for an account. Best-effort: a
    /// failure to persist here does not affect serving traffic, since the
    /// pool's in-memory quota state is already updated by the caller.
    pub async fn set_quota(&self, email: &str, quota: QuotaState) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(record) = state.get_mut(email) else {
            return Ok(());
        };
        record.quota = quota;
        write_atomic(&self.path, &state).await
    }

    /// Stamp an account's last-used timestamp.
    pub async fn touch_last_used(&self, email: &str, at_ms: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(record) = state.get_mut(email) else {
            return Ok(());
        };
        record.last_used = Some(at_ms);
        write_atomic(&self.path, &state).await
    }

    /// Force the next token read to refresh, by zeroing the cached expiry.
    pub async fn invalidate_token(&self, email: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(email)
            .ok_or_else(|| Error::NotFound(format!("account {email} not in record store")))?;
        record.expires = 0;
        write_atomic(&self.path, &state).await
    }

    /// Drop the resolved project id, forcing rediscovery on next use.
    pub async fn clear_project(&self, email: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(record) = state.get_mut(email) else {
            return Ok(());
        };
        if let Some(sub) = record.subscription.as_mut() {
            sub.project_id = None;
        }
        write_atomic(&self.path, &state).await
    }

    /// Number of stored account records.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write account records to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. This prevents corruption if the process crashes mid-write.
/// Sets file permissions to 0600 (owner read/write only) since the file
/// contains OAuth tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, AccountRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::RecordParse(format!("serializing account records: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("account record path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp account record file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting account record file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp account record file: {e}")))?;

    debug!(path = %path.display(), "persisted account records");
    Ok(())
}
