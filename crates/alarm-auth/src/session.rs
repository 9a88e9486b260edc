//! Session state holder
//!
//! One `SessionStore` per running client, passed to whatever needs it. It
//! starts unauthenticated and changes only through `establish` (login),
//! `refresh` (recover a persisted session) and `logout`. Everything else
//! reads.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::constants::{SESSION_STORAGE_KEY, VERIFIER_STORAGE_KEY};
use crate::error::{Error, Result};
use crate::redirect::now_millis;
use crate::storage::LocalStorage;
use crate::token::TokenExchangeResponse;

/// The signed-in user, as far as the ID token tells us.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    /// `sub` claim; empty if the token carries none
    pub id: String,
    pub email: String,
}

/// An authenticated session. Tokens are redacted in Debug output.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
    id_token: Secret<String>,
    access_token: Option<Secret<String>>,
    refresh_token: Option<Secret<String>>,
    /// Unix milliseconds, when known
    pub expires_at_ms: Option<u64>,
}

impl Session {
    fn from_tokens(
        id_token: String,
        access_token: Option<String>,
        refresh_token: Option<String>,
        expires_at_ms: Option<u64>,
    ) -> Self {
        let claims = decode_claims(&id_token).unwrap_or_default();
        let expires_at_ms = expires_at_ms.or(claims.exp.map(|exp| exp.saturating_mul(1000)));
        Self {
            user: User {
                id: claims.sub.unwrap_or_default(),
                email: claims.email.unwrap_or_default(),
            },
            id_token: Secret::new(id_token),
            access_token: access_token.map(Secret::new),
            refresh_token: refresh_token.map(Secret::new),
            expires_at_ms,
        }
    }

    /// Token sent as `Authorization: Bearer` to the backend.
    pub fn bearer_token(&self) -> &str {
        self.id_token.expose()
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            id_token: self.id_token.expose().clone(),
            access_token: self.access_token.as_ref().map(|t| t.expose().clone()),
            refresh_token: self.refresh_token.as_ref().map(|t| t.expose().clone()),
            expires_at_ms: self.expires_at_ms,
        }
    }
}

/// On-disk form of a session under the `session` storage key.
#[derive(Serialize, Deserialize)]
struct PersistedSession {
    id_token: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at_ms: Option<u64>,
}

#[derive(Default, Deserialize)]
struct IdClaims {
    sub: Option<String>,
    email: Option<String>,
    exp: Option<u64>,
}

/// Read the payload of a JWT without verifying it. The backend issued the
/// token over TLS; we only need the identity fields for display and expiry.
fn decode_claims(jwt: &str) -> Option<IdClaims> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Process-wide session holder, cheap to clone.
#[derive(Clone)]
pub struct SessionStore {
    current: Arc<RwLock<Option<Session>>>,
    storage: Arc<LocalStorage>,
}

impl SessionStore {
    /// A new store is always unauthenticated; call `refresh` to recover a
    /// persisted session.
    pub fn new(storage: Arc<LocalStorage>) -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            storage,
        }
    }

    /// The current session, unless absent or expired.
    pub async fn current(&self) -> Option<Session> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|s| !s.is_expired(now_millis()))
            .cloned()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current().await.is_some()
    }

    pub async fn bearer_token(&self) -> Option<String> {
        self.current().await.map(|s| s.bearer_token().to_string())
    }

    /// Install the session returned by a successful token exchange.
    ///
    /// The session is persisted so a restart can recover it; a storage
    /// failure is logged but doesn't undo the login.
    pub async fn establish(&self, tokens: TokenExchangeResponse) -> Result<Session> {
        if tokens.id_token.is_empty() {
            return Err(Error::TokenExchange(
                "exchange response carried an empty idToken".into(),
            ));
        }
        let expires_at_ms = tokens
            .expires_in
            .map(|secs| now_millis().saturating_add(secs.saturating_mul(1000)));
        let session = Session::from_tokens(
            tokens.id_token,
            tokens.access_token,
            tokens.refresh_token,
            expires_at_ms,
        );

        if let Err(e) = self
            .storage
            .set(SESSION_STORAGE_KEY, &session.to_persisted())
            .await
        {
            warn!(error = %e, "failed to persist session");
        }
        *self.current.write().await = Some(session.clone());
        info!(user_id = %session.user.id, "session established");
        Ok(session)
    }

    /// Re-derive the session from persisted credentials.
    ///
    /// Nothing persisted, or an expired session, means logged out. That is
    /// not an error.
    pub async fn refresh(&self) -> Option<Session> {
        let persisted: Option<PersistedSession> = self.storage.get(SESSION_STORAGE_KEY).await;
        let session = persisted
            .map(|p| {
                Session::from_tokens(p.id_token, p.access_token, p.refresh_token, p.expires_at_ms)
            })
            .filter(|s| !s.is_expired(now_millis()));

        match &session {
            Some(s) => debug!(user_id = %s.user.id, "recovered persisted session"),
            None => {
                debug!("no valid persisted session");
                if let Err(e) = self.storage.remove(SESSION_STORAGE_KEY).await {
                    warn!(error = %e, "failed to drop stale session entry");
                }
            }
        }
        *self.current.write().await = session.clone();
        session
    }

    /// Log out: forget the session and any lingering verifier.
    pub async fn logout(&self) -> Result<()> {
        *self.current.write().await = None;
        self.storage.remove(SESSION_STORAGE_KEY).await?;
        self.storage.remove(VERIFIER_STORAGE_KEY).await?;
        info!("logged out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.sig")
    }

    fn tokens(id_token: &str) -> TokenExchangeResponse {
        serde_json::from_value(serde_json::json!({ "idToken": id_token })).unwrap()
    }

    async fn store(dir: &tempfile::TempDir) -> (SessionStore, Arc<LocalStorage>) {
        let storage = Arc::new(
            LocalStorage::open(dir.path().join("storage.json"))
                .await
                .unwrap(),
        );
        (SessionStore::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn starts_unauthenticated() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, _) = store(&dir).await;
        assert!(sessions.current().await.is_none());
        assert!(!sessions.is_authenticated().await);
        assert!(sessions.bearer_token().await.is_none());
    }

    #[tokio::test]
    async fn establish_decodes_identity_from_id_token() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, _) = store(&dir).await;
        let id_token = jwt(serde_json::json!({"sub": "user-1", "email": "a@example.com"}));

        let session = sessions.establish(tokens(&id_token)).await.unwrap();
        assert_eq!(session.user.id, "user-1");
        assert_eq!(session.user.email, "a@example.com");
        assert_eq!(sessions.bearer_token().await.as_deref(), Some(id_token.as_str()));
    }

    #[tokio::test]
    async fn opaque_token_still_establishes() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, _) = store(&dir).await;

        let session = sessions.establish(tokens("t1")).await.unwrap();
        assert_eq!(session.user.id, "");
        assert!(sessions.is_authenticated().await);
    }

    #[tokio::test]
    async fn empty_id_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, _) = store(&dir).await;

        assert!(sessions.establish(tokens("")).await.is_err());
        assert!(!sessions.is_authenticated().await);
    }

    #[tokio::test]
    async fn refresh_recovers_persisted_session() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, storage) = store(&dir).await;
        sessions.establish(tokens("t1")).await.unwrap();

        // A fresh store over the same storage starts logged out
        let restarted = SessionStore::new(storage);
        assert!(!restarted.is_authenticated().await);
        let recovered = restarted.refresh().await.unwrap();
        assert_eq!(recovered.bearer_token(), "t1");
        assert!(restarted.is_authenticated().await);
    }

    #[tokio::test]
    async fn refresh_without_persisted_session_is_logged_out() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, _) = store(&dir).await;
        assert!(sessions.refresh().await.is_none());
        assert!(!sessions.is_authenticated().await);
    }

    #[tokio::test]
    async fn expired_session_is_not_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, storage) = store(&dir).await;
        let id_token = jwt(serde_json::json!({"sub": "u", "exp": 1}));
        sessions.establish(tokens(&id_token)).await.unwrap();

        // exp claim is in 1970, so the session reads as absent
        assert!(sessions.current().await.is_none());
        assert!(sessions.refresh().await.is_none());
        assert!(!storage.contains(SESSION_STORAGE_KEY).await);
    }

    #[tokio::test]
    async fn expires_in_takes_precedence_over_exp_claim() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, _) = store(&dir).await;
        let id_token = jwt(serde_json::json!({"exp": 1}));
        let response: TokenExchangeResponse = serde_json::from_value(serde_json::json!({
            "idToken": id_token,
            "expiresIn": 3600
        }))
        .unwrap();

        sessions.establish(response).await.unwrap();
        assert!(sessions.is_authenticated().await);
    }

    #[tokio::test]
    async fn logout_clears_session_and_verifier() {
        let dir = tempfile::tempdir().unwrap();
        let (sessions, storage) = store(&dir).await;
        sessions.establish(tokens("t1")).await.unwrap();
        storage
            .set(VERIFIER_STORAGE_KEY, &serde_json::json!({"state": "s"}))
            .await
            .unwrap();

        sessions.logout().await.unwrap();
        assert!(sessions.current().await.is_none());
        assert!(!storage.contains(SESSION_STORAGE_KEY).await);
        assert!(!storage.contains(VERIFIER_STORAGE_KEY).await);
        assert!(sessions.refresh().await.is_none());
    }

    #[test]
    fn session_debug_hides_tokens() {
        let session = Session::from_tokens("t-secret".into(), Some("a-secret".into()), None, None);
        let debug = format!("{session:?}");
        assert!(!debug.contains("t-secret"));
        assert!(!debug.contains("a-secret"));
        assert_eq!(
            session.to_persisted().access_token.as_deref(),
            Some("a-secret")
        );
    }
}
