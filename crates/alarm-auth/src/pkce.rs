//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! The verifier stays on this side of the redirect; only its S256 challenge
//! travels to the identity provider. The verifier is revealed once, in the
//! backend token exchange, proving the exchange comes from whoever started
//! the flow. A `state` value generated alongside binds the returning
//! authorization code to the verifier that was stored for it.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::constants::{STATE_BYTES, VERIFIER_BYTES};
use crate::error::{Error, Result};

/// Generate a fresh code verifier from the OS random source.
///
/// 32 random bytes encoded as URL-safe base64 without padding, giving 43
/// characters (the RFC 7636 minimum). There is no fallback source: if the
/// OS cannot supply randomness the login attempt fails.
pub fn generate_verifier() -> Result<String> {
    random_token::<VERIFIER_BYTES>()
}

/// Compute the S256 challenge: `BASE64URL(SHA256(verifier))`.
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate the opaque `state` value echoed back by the identity provider.
pub fn generate_state() -> Result<String> {
    random_token::<STATE_BYTES>()
}

fn random_token<const N: usize>() -> Result<String> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| Error::Randomness(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
