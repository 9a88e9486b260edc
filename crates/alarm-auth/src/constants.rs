//! Fixed names and limits of the sign-in flow
//!
//! The identity provider endpoints and client ID are deployment settings and
//! come from configuration. What lives here is the part every deployment
//! shares with the backend contract.

/// Local storage key holding the pending authorization (verifier + state).
pub const VERIFIER_STORAGE_KEY: &str = "code_verifier";

/// Local storage key holding the persisted session.
pub const SESSION_STORAGE_KEY: &str = "session";

/// Backend path that trades an authorization code + verifier for a session.
pub const TOKEN_EXCHANGE_PATH: &str = "/calendar/auth";

/// Scopes requested when the configuration does not override them.
pub const DEFAULT_SCOPES: &[&str] = &["email", "openid", "profile"];

/// Random bytes behind each verifier (43 base64url characters).
pub const VERIFIER_BYTES: usize = 32;

/// Random bytes behind each `state` value (22 base64url characters).
pub const STATE_BYTES: usize = 16;

/// A pending authorization older than this is treated as abandoned.
pub const PENDING_EXPIRY_SECS: u64 = 600;

/// Where the user lands once the callback establishes a session.
pub const LANDING_PATH: &str = "/calendar";

/// Where the user restarts sign-in.
pub const LOGIN_PATH: &str = "/auth/login";
