//! Cloud Code OAuth authentication library
//!
//! Provides PKCE flow generation, token exchange/refresh, and account record
//! file storage for the Cloud Code proxy. This crate is a standalone library
//! with no dependency on the proxy binary — it can be tested and used
//! independently.
//!
//! Credential flow:
//! 1. Admin calls `pkce::generate_verifier()` + `pkce::compute_challenge()`
//! 2. User authorizes via `pkce::build_authorization_url()`
//! 3. Gateway calls `token::exchange_code()` with the authorization code
//! 4. Record stored via `record::AccountStore::add()`
//! 5. Background task calls `token::refresh_token()` proactively
//! 6. Updated tokens saved via `record::AccountStore::update_token()`

pub mod constants;
pub mod error;
pub mod pkce;
pub mod record;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use pkce::{build_authorization_url, compute_challenge, generate_verifier};
pub use record::{AccountRecord, AccountSource, AccountStore, ModelQuota, QuotaState, Subscription};
pub use token::{TokenResponse, exchange_code, refresh_token};
