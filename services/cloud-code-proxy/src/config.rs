//! Configuration types and loading
//!
//! TOML config for the proxy-specific tunables (listener addresses, endpoint
//! fallback list, model fallback chain, executor tunables). Account
//! credentials live in their own on-disk store (`cloud_code_auth::AccountStore`),
//! not here — this file only ever points at that store's path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use cloud_code_executor::ExecutorConfig;

use crate::error::{Error, Result};

/// Root configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub executor: ExecutorConfig,
    pub headers: Vec<HeaderInjection>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            executor: ExecutorConfig::default(),
            headers: Vec::new(),
        }
    }
}

/// HTTP listener and upstream routing settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,
    pub accounts_path: PathBuf,
    /// Ordered base URLs tried for the same logical call (spec.md §6).
    pub endpoints: Vec<String>,
    /// `model -> fallback model` chain (spec.md §4.3).
    pub fallback_chain: HashMap<String, String>,
    pub fallback_enabled: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_listen_addr: default_admin_listen_addr(),
            accounts_path: default_accounts_path(),
            endpoints: Vec::new(),
            fallback_chain: HashMap::new(),
            fallback_enabled: true,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_admin_listen_addr() -> SocketAddr {
    "127.0.0.1:9090".parse().unwrap()
}

fn default_accounts_path() -> PathBuf {
    PathBuf::from("accounts.json")
}

/// Header to inject on every outbound request (passthrough mode only).
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub async fn load(path: &PathBuf) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Resolve the config file path: `--config <path>` CLI flag, else
    /// `CLOUD_CODE_PROXY_CONFIG` env var, else `./config.toml`.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CLOUD_CODE_PROXY_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("config.toml")
    }
}
