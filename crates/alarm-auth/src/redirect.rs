//! Authorization redirect initiation
//!
//! Starts one sign-in attempt: stores the verifier where it survives the
//! round trip through the identity provider, then hands back the URL the
//! user agent must be sent to. Only the most recent attempt is honored;
//! starting a new one overwrites any pending verifier.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::constants::{PENDING_EXPIRY_SECS, VERIFIER_STORAGE_KEY};
use crate::error::{Error, Result};
use crate::pkce::{compute_challenge, generate_state, generate_verifier};
use crate::storage::LocalStorage;

/// Identity provider settings needed to build the authorization URL.
#[derive(Debug, Clone)]
pub struct IdentityProvider {
    pub authorize_endpoint: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// The verifier of the attempt in flight, bound to the `state` sent with it.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub state: String,
    pub verifier: String,
    /// Unix milliseconds when the attempt started
    pub created_at_ms: u64,
}

impl PendingAuthorization {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > PENDING_EXPIRY_SECS * 1000
    }
}

impl fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("state", &self.state)
            .field("verifier", &common::REDACTED)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

/// Where to send the user agent to continue sign-in.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: Url,
    pub state: String,
}

/// Build the authorization URL carrying the S256 challenge and `state`.
pub fn build_authorization_url(
    provider: &IdentityProvider,
    state: &str,
    challenge: &str,
) -> Result<Url> {
    let scope = provider.scopes.join(" ");
    Url::parse_with_params(
        &provider.authorize_endpoint,
        &[
            ("response_type", "code"),
            ("client_id", provider.client_id.as_str()),
            ("redirect_uri", provider.redirect_uri.as_str()),
            ("scope", scope.as_str()),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
            ("state", state),
        ],
    )
    .map_err(|e| {
        Error::InvalidRequest(format!(
            "authorize endpoint {:?} is not a URL: {e}",
            provider.authorize_endpoint
        ))
    })
}

/// Start a sign-in attempt.
///
/// Generates a verifier and `state`, persists them under `code_verifier`
/// (replacing any abandoned attempt) and returns the provider URL. Fails
/// without touching storage if no secure randomness is available.
pub async fn begin_authorization(
    storage: &LocalStorage,
    provider: &IdentityProvider,
) -> Result<AuthorizationRedirect> {
    let verifier = generate_verifier()?;
    let state = generate_state()?;
    let url = build_authorization_url(provider, &state, &compute_challenge(&verifier))?;

    let pending = PendingAuthorization {
        state: state.clone(),
        verifier,
        created_at_ms: now_millis(),
    };
    let replaced = storage.set(VERIFIER_STORAGE_KEY, &pending).await?;
    if replaced {
        info!("replaced pending authorization from an abandoned attempt");
    }
    info!(state = %state, "authorization redirect prepared");

    Ok(AuthorizationRedirect { url, state })
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
