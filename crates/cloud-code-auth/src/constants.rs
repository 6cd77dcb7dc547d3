//! Cloud Code OAuth constants.
//!
//! Public OAuth client configuration matching the reference Cloud Code CLI
//! client. These values identify the public client application; the actual
//! secrets (access/refresh tokens) live in the account store, never here.

/// Cloud Code's public OAuth client ID (same as the reference CLI).
pub const CLOUD_CODE_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6avd8ps6o6vdr.apps.googleusercontent.com";

/// OAuth redirect URI used for the installed-app loopback flow.
pub const REDIRECT_URI: &str = "http://localhost:51121/oauth/callback";

/// Token endpoint for code exchange and token refresh.
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Authorization endpoint for the installed-app OAuth flow.
pub const AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// OAuth scopes required for Cloud Code inference access.
pub const SCOPES: &str =
    "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email";

/// Upstream generateContent/streamGenerateContent API version segment.
pub const API_VERSION: &str = "v1internal";

/// Refresh a cached access token once this many seconds of validity remain.
pub const TOKEN_REFRESH_SKEW_SECS: u64 = 120;
