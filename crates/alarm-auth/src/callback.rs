//! Authorization callback state machine
//!
//! `handle_event` is pure: it receives an event and returns
//! `(new_state, action)`. `CallbackHandler` owns the state, feeds it the
//! inputs (URL parameters, the stored verifier, the exchange result) and
//! executes the I/O each action implies.
//!
//! ```text
//! Idle -> AwaitingParams -> Exchanging -> Established
//!                                    \--> Failed
//! ```
//!
//! An authorization code is exchanged at most once. Re-delivering the same
//! code while its exchange is in flight, or after it settled, is answered
//! from the current state without another network call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{LANDING_PATH, VERIFIER_STORAGE_KEY};
use crate::error::Error;
use crate::redirect::{PendingAuthorization, now_millis};
use crate::session::{Session, SessionStore};
use crate::storage::LocalStorage;
use crate::token::TokenClient;

/// Query parameters of the redirect back from the identity provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Why the callback cannot proceed without the user restarting sign-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stall {
    MissingCode,
    MissingVerifier,
}

impl Stall {
    pub fn message(&self) -> &'static str {
        match self {
            Stall::MissingCode => {
                "the sign-in response carried no authorization code; please restart sign-in"
            }
            Stall::MissingVerifier => {
                "no sign-in is pending on this client; please restart sign-in"
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum CallbackState {
    #[default]
    Idle,
    /// Reading the code and verifier. `stalled` is set when one is missing.
    AwaitingParams { stalled: Option<Stall> },
    /// One exchange call outstanding for `code`
    Exchanging {
        attempt: u64,
        code: String,
        state: String,
    },
    Established { code: String },
    Failed { code: Option<String>, error: String },
}

impl CallbackState {
    /// The code this state already acted on, if any.
    fn handled_code(&self) -> Option<&str> {
        match self {
            CallbackState::Exchanging { code, .. } | CallbackState::Established { code } => {
                Some(code)
            }
            CallbackState::Failed { code, .. } => code.as_deref(),
            CallbackState::Idle | CallbackState::AwaitingParams { .. } => None,
        }
    }

    pub fn phase(&self) -> &'static str {
        match self {
            CallbackState::Idle => "idle",
            CallbackState::AwaitingParams { .. } => "awaiting_params",
            CallbackState::Exchanging { .. } => "exchanging",
            CallbackState::Established { .. } => "established",
            CallbackState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug)]
pub enum CallbackEvent {
    /// The callback view was (re)loaded with this code in its URL
    ViewLoaded { code: Option<String> },
    /// URL parameters and stored verifier have been read
    ParamsRead {
        attempt: u64,
        code: Option<String>,
        returned_state: Option<String>,
        provider_error: Option<String>,
        pending: Option<PendingAuthorization>,
        now_ms: u64,
    },
    ExchangeSucceeded { attempt: u64 },
    ExchangeFailed { attempt: u64, error: String },
    /// The view went away; later results must not touch anything
    TornDown,
}

/// Actions the caller executes after a transition.
#[derive(Debug, PartialEq)]
pub enum CallbackAction {
    /// Read the code from the URL and the verifier from storage
    ReadParams,
    /// Issue the one exchange call for this code
    Exchange {
        attempt: u64,
        code: String,
        verifier: Secret<String>,
    },
    /// Tell the user to restart sign-in
    ReportStalled(Stall),
    /// Refuse the response without a network call. `abandon` names the
    /// pending attempt (by its `state`) whose verifier must be dropped.
    Reject {
        error: String,
        abandon: Option<String>,
    },
    /// Clear the verifier, install the session, go to the landing view
    CompleteLogin { state: String },
    /// Clear the verifier and surface the error
    ReportFailure { error: String, state: String },
    /// A result for an attempt that is no longer current
    Discard,
    /// Teardown cut an exchange short. Its code was already sent, so the
    /// verifier of attempt `state` must go.
    Abandon { state: String },
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: CallbackState, event: CallbackEvent) -> (CallbackState, CallbackAction) {
    match (state, event) {
        // --- Re-render guard ---
        (state @ CallbackState::Exchanging { .. }, CallbackEvent::ViewLoaded { .. }) => {
            (state, CallbackAction::None)
        }
        (state, CallbackEvent::ViewLoaded { code: Some(code) })
            if state.handled_code() == Some(code.as_str()) =>
        {
            (state, CallbackAction::None)
        }
        (_, CallbackEvent::ViewLoaded { .. }) => (
            CallbackState::AwaitingParams { stalled: None },
            CallbackAction::ReadParams,
        ),

        // --- AwaitingParams ---
        (
            CallbackState::AwaitingParams { .. },
            CallbackEvent::ParamsRead {
                attempt,
                code,
                returned_state,
                provider_error,
                pending,
                now_ms,
            },
        ) => read_params(attempt, code, returned_state, provider_error, pending, now_ms),

        // --- Exchanging ---
        (
            CallbackState::Exchanging {
                attempt: current,
                code,
                state,
            },
            CallbackEvent::ExchangeSucceeded { attempt },
        ) if current == attempt => (
            CallbackState::Established { code },
            CallbackAction::CompleteLogin { state },
        ),

        (
            CallbackState::Exchanging {
                attempt: current,
                code,
                state,
            },
            CallbackEvent::ExchangeFailed { attempt, error },
        ) if current == attempt => (
            CallbackState::Failed {
                code: Some(code),
                error: error.clone(),
            },
            CallbackAction::ReportFailure { error, state },
        ),

        (
            state,
            CallbackEvent::ExchangeSucceeded { .. } | CallbackEvent::ExchangeFailed { .. },
        ) => (state, CallbackAction::Discard),

        // --- Teardown ---
        (CallbackState::Exchanging { state, .. }, CallbackEvent::TornDown) => {
            (CallbackState::Idle, CallbackAction::Abandon { state })
        }
        (_, CallbackEvent::TornDown) => (CallbackState::Idle, CallbackAction::None),

        // ParamsRead outside AwaitingParams: nothing asked for it
        (state, CallbackEvent::ParamsRead { .. }) => (state, CallbackAction::None),
    }
}

fn read_params(
    attempt: u64,
    code: Option<String>,
    returned_state: Option<String>,
    provider_error: Option<String>,
    pending: Option<PendingAuthorization>,
    now_ms: u64,
) -> (CallbackState, CallbackAction) {
    let belongs_to_pending =
        |p: &PendingAuthorization| returned_state.as_deref() == Some(p.state.as_str());

    if let Some(provider_error) = provider_error {
        let abandon = pending
            .as_ref()
            .filter(|&p| belongs_to_pending(p))
            .map(|p| p.state.clone());
        let error = format!("identity provider refused sign-in: {provider_error}");
        return (
            CallbackState::Failed {
                code,
                error: error.clone(),
            },
            CallbackAction::Reject { error, abandon },
        );
    }

    let Some(code) = code else {
        return stalled(Stall::MissingCode);
    };
    let Some(pending) = pending else {
        return stalled(Stall::MissingVerifier);
    };

    if !belongs_to_pending(&pending) {
        let error = String::from(
            "sign-in response does not match the pending sign-in (state mismatch); please restart sign-in",
        );
        return (
            CallbackState::Failed {
                code: Some(code),
                error: error.clone(),
            },
            CallbackAction::Reject {
                error,
                abandon: None,
            },
        );
    }

    if pending.is_expired(now_ms) {
        let error = String::from("sign-in took too long and expired; please restart sign-in");
        return (
            CallbackState::Failed {
                code: Some(code),
                error: error.clone(),
            },
            CallbackAction::Reject {
                error,
                abandon: Some(pending.state),
            },
        );
    }

    (
        CallbackState::Exchanging {
            attempt,
            code: code.clone(),
            state: pending.state,
        },
        CallbackAction::Exchange {
            attempt,
            code,
            verifier: Secret::new(pending.verifier),
        },
    )
}

fn stalled(stall: Stall) -> (CallbackState, CallbackAction) {
    (
        CallbackState::AwaitingParams {
            stalled: Some(stall),
        },
        CallbackAction::ReportStalled(stall),
    )
}

/// What a call to `CallbackHandler::handle` ended in.
#[derive(Debug)]
pub enum CallbackOutcome {
    /// Session installed; send the user to the landing view
    Established(Session),
    /// This code was already exchanged successfully
    AlreadyEstablished,
    /// The exchange for this code is still outstanding
    InFlight,
    Stalled(Stall),
    Failed(String),
    /// The handler was reset while this call was outstanding
    Discarded,
}

impl CallbackOutcome {
    /// Where the user agent should go next, if anywhere.
    pub fn redirect_to(&self) -> Option<&'static str> {
        match self {
            CallbackOutcome::Established(_) | CallbackOutcome::AlreadyEstablished => {
                Some(LANDING_PATH)
            }
            _ => None,
        }
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CallbackOutcome::Established(_) => "established",
            CallbackOutcome::AlreadyEstablished => "already_established",
            CallbackOutcome::InFlight => "in_flight",
            CallbackOutcome::Stalled(_) => "stalled",
            CallbackOutcome::Failed(_) => "failed",
            CallbackOutcome::Discarded => "discarded",
        }
    }
}

/// Observable snapshot of the callback state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackStatus {
    pub phase: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stalled: Option<Stall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives the callback state machine.
///
/// The state lock is held while transitioning and reading storage, never
/// across the exchange call, so concurrent deliveries of one code see
/// `Exchanging` and back off.
pub struct CallbackHandler {
    state: Mutex<CallbackState>,
    attempts: AtomicU64,
    storage: Arc<LocalStorage>,
    sessions: SessionStore,
    tokens: TokenClient,
}

impl CallbackHandler {
    pub fn new(storage: Arc<LocalStorage>, sessions: SessionStore, tokens: TokenClient) -> Self {
        Self {
            state: Mutex::new(CallbackState::Idle),
            attempts: AtomicU64::new(0),
            storage,
            sessions,
            tokens,
        }
    }

    /// Process one load of the callback view.
    pub async fn handle(&self, params: CallbackParams) -> CallbackOutcome {
        let action = {
            let mut state = self.state.lock().await;
            let action = self.transition(
                &mut state,
                CallbackEvent::ViewLoaded {
                    code: params.code.clone(),
                },
            );
            match action {
                CallbackAction::ReadParams => {
                    let pending: Option<PendingAuthorization> =
                        self.storage.get(VERIFIER_STORAGE_KEY).await;
                    let provider_error = params.error.map(|error| match params.error_description {
                        Some(description) => format!("{error} ({description})"),
                        None => error,
                    });
                    let event = CallbackEvent::ParamsRead {
                        attempt: self.attempts.fetch_add(1, Ordering::SeqCst) + 1,
                        code: params.code,
                        returned_state: params.state,
                        provider_error,
                        pending,
                        now_ms: now_millis(),
                    };
                    self.transition(&mut state, event)
                }
                other => other,
            }
        };

        match action {
            CallbackAction::Exchange {
                attempt,
                code,
                verifier,
            } => self.exchange(attempt, code, verifier).await,
            CallbackAction::ReportStalled(stall) => {
                warn!(?stall, "callback stalled");
                CallbackOutcome::Stalled(stall)
            }
            CallbackAction::Reject { error, abandon } => {
                if let Some(state) = abandon {
                    self.clear_verifier(&state).await;
                }
                warn!(error = %error, "callback rejected");
                CallbackOutcome::Failed(error)
            }
            _ => self.settled_outcome().await,
        }
    }

    async fn exchange(&self, attempt: u64, code: String, verifier: Secret<String>) -> CallbackOutcome {
        info!(attempt, "exchanging authorization code");
        let bearer = self.sessions.bearer_token().await;
        let result = self
            .tokens
            .exchange_code(&code, verifier.expose(), bearer.as_deref())
            .await
            .and_then(|tokens| {
                if tokens.id_token.is_empty() {
                    Err(Error::TokenExchange(
                        "exchange response carried an empty idToken".into(),
                    ))
                } else {
                    Ok(tokens)
                }
            });

        let event = match &result {
            Ok(_) => CallbackEvent::ExchangeSucceeded { attempt },
            Err(e) => CallbackEvent::ExchangeFailed {
                attempt,
                error: e.to_string(),
            },
        };
        // Held until the session is installed: a concurrent `reset` either
        // discards this result or runs after the session exists.
        let mut current = self.state.lock().await;
        let action = self.transition(&mut current, event);

        match (action, result) {
            (CallbackAction::CompleteLogin { state }, Ok(tokens)) => {
                self.clear_verifier(&state).await;
                match self.sessions.establish(tokens).await {
                    Ok(session) => {
                        info!(attempt, "sign-in complete");
                        CallbackOutcome::Established(session)
                    }
                    Err(e) => {
                        let error = e.to_string();
                        *current = CallbackState::Failed {
                            code: Some(code),
                            error: error.clone(),
                        };
                        CallbackOutcome::Failed(error)
                    }
                }
            }
            (CallbackAction::ReportFailure { error, state }, _) => {
                // The provider consumed the code either way; the verifier is spent
                self.clear_verifier(&state).await;
                warn!(attempt, error = %error, "token exchange failed");
                CallbackOutcome::Failed(error)
            }
            _ => {
                debug!(attempt, "discarding exchange result for a superseded attempt");
                CallbackOutcome::Discarded
            }
        }
    }

    fn transition(&self, state: &mut CallbackState, event: CallbackEvent) -> CallbackAction {
        let (next, action) = handle_event(std::mem::take(state), event);
        debug!(phase = next.phase(), "callback transition");
        *state = next;
        action
    }

    /// Remove the stored verifier, but only if it still belongs to the
    /// attempt identified by `state`; a newer attempt keeps its own.
    async fn clear_verifier(&self, state: &str) {
        let pending: Option<PendingAuthorization> = self.storage.get(VERIFIER_STORAGE_KEY).await;
        if pending.is_some_and(|p| p.state == state) {
            if let Err(e) = self.storage.remove(VERIFIER_STORAGE_KEY).await {
                warn!(error = %e, "failed to clear stored verifier");
            }
        }
    }

    async fn settled_outcome(&self) -> CallbackOutcome {
        match &*self.state.lock().await {
            CallbackState::Exchanging { .. } => CallbackOutcome::InFlight,
            CallbackState::Established { .. } => CallbackOutcome::AlreadyEstablished,
            CallbackState::Failed { error, .. } => CallbackOutcome::Failed(error.clone()),
            CallbackState::AwaitingParams {
                stalled: Some(stall),
            } => CallbackOutcome::Stalled(*stall),
            CallbackState::Idle | CallbackState::AwaitingParams { stalled: None } => {
                CallbackOutcome::Discarded
            }
        }
    }

    pub async fn status(&self) -> CallbackStatus {
        let state = self.state.lock().await;
        let (stalled, error) = match &*state {
            CallbackState::AwaitingParams { stalled } => (*stalled, None),
            CallbackState::Failed { error, .. } => (None, Some(error.clone())),
            _ => (None, None),
        };
        CallbackStatus {
            phase: state.phase(),
            stalled,
            error,
        }
    }

    /// Tear the handler down: back to `Idle`, and any exchange still
    /// outstanding will have its result discarded.
    ///
    /// Once this returns no outstanding exchange can install a session, so
    /// callers clearing the session must reset first.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let CallbackAction::Abandon { state: pending } =
            self.transition(&mut state, CallbackEvent::TornDown)
        {
            info!("sign-in torn down during exchange, dropping its verifier");
            self.clear_verifier(&pending).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn pending(state: &str, verifier: &str) -> PendingAuthorization {
        PendingAuthorization {
            state: state.into(),
            verifier: verifier.into(),
            created_at_ms: now_millis(),
        }
    }

    fn params_read(code: Option<&str>, returned_state: Option<&str>) -> CallbackEvent {
        CallbackEvent::ParamsRead {
            attempt: 1,
            code: code.map(String::from),
            returned_state: returned_state.map(String::from),
            provider_error: None,
            pending: Some(pending("s1", "v1")),
            now_ms: now_millis(),
        }
    }

    fn awaiting() -> CallbackState {
        CallbackState::AwaitingParams { stalled: None }
    }

    fn exchanging(attempt: u64) -> CallbackState {
        CallbackState::Exchanging {
            attempt,
            code: "abc".into(),
            state: "s1".into(),
        }
    }

    // --- pure state machine ---

    #[test]
    fn idle_to_awaiting_on_view_loaded() {
        let (state, action) = handle_event(
            CallbackState::Idle,
            CallbackEvent::ViewLoaded {
                code: Some("abc".into()),
            },
        );
        assert_eq!(state, awaiting());
        assert_eq!(action, CallbackAction::ReadParams);
    }

    #[test]
    fn awaiting_to_exchanging_with_code_and_verifier() {
        let (state, action) = handle_event(awaiting(), params_read(Some("abc"), Some("s1")));
        assert_eq!(state, exchanging(1));
        assert_eq!(
            action,
            CallbackAction::Exchange {
                attempt: 1,
                code: "abc".into(),
                verifier: Secret::new("v1".into()),
            }
        );
    }

    #[test]
    fn missing_code_stalls_visibly() {
        let (state, action) = handle_event(awaiting(), params_read(None, Some("s1")));
        assert_eq!(
            state,
            CallbackState::AwaitingParams {
                stalled: Some(Stall::MissingCode)
            }
        );
        assert_eq!(action, CallbackAction::ReportStalled(Stall::MissingCode));
    }

    #[test]
    fn missing_verifier_stalls_visibly() {
        let (state, action) = handle_event(
            awaiting(),
            CallbackEvent::ParamsRead {
                attempt: 1,
                code: Some("abc".into()),
                returned_state: Some("s1".into()),
                provider_error: None,
                pending: None,
                now_ms: now_millis(),
            },
        );
        assert!(matches!(
            state,
            CallbackState::AwaitingParams {
                stalled: Some(Stall::MissingVerifier)
            }
        ));
        assert_eq!(action, CallbackAction::ReportStalled(Stall::MissingVerifier));
    }

    #[test]
    fn state_mismatch_is_rejected_and_keeps_other_attempts_verifier() {
        let (state, action) = handle_event(awaiting(), params_read(Some("abc"), Some("other")));
        assert!(matches!(state, CallbackState::Failed { .. }));
        assert!(matches!(
            action,
            CallbackAction::Reject { abandon: None, ref error } if error.contains("state mismatch")
        ));
    }

    #[test]
    fn missing_state_is_rejected() {
        let (state, action) = handle_event(awaiting(), params_read(Some("abc"), None));
        assert!(matches!(state, CallbackState::Failed { .. }));
        assert!(matches!(action, CallbackAction::Reject { abandon: None, .. }));
    }

    #[test]
    fn expired_attempt_is_abandoned() {
        let (state, action) = handle_event(
            awaiting(),
            CallbackEvent::ParamsRead {
                attempt: 1,
                code: Some("abc".into()),
                returned_state: Some("s1".into()),
                provider_error: None,
                pending: Some(PendingAuthorization {
                    state: "s1".into(),
                    verifier: "v1".into(),
                    created_at_ms: 0,
                }),
                now_ms: now_millis(),
            },
        );
        assert!(matches!(state, CallbackState::Failed { .. }));
        assert!(matches!(
            action,
            CallbackAction::Reject { abandon: Some(ref s), .. } if s == "s1"
        ));
    }

    #[test]
    fn provider_error_fails_and_abandons_matching_attempt() {
        let (state, action) = handle_event(
            awaiting(),
            CallbackEvent::ParamsRead {
                attempt: 1,
                code: None,
                returned_state: Some("s1".into()),
                provider_error: Some("access_denied".into()),
                pending: Some(pending("s1", "v1")),
                now_ms: now_millis(),
            },
        );
        assert!(
            matches!(state, CallbackState::Failed { ref error, .. } if error.contains("access_denied"))
        );
        assert!(matches!(
            action,
            CallbackAction::Reject { abandon: Some(ref s), .. } if s == "s1"
        ));
    }

    #[test]
    fn exchanging_to_established_on_success() {
        let (state, action) =
            handle_event(exchanging(3), CallbackEvent::ExchangeSucceeded { attempt: 3 });
        assert_eq!(
            state,
            CallbackState::Established {
                code: "abc".into()
            }
        );
        assert_eq!(
            action,
            CallbackAction::CompleteLogin {
                state: "s1".into()
            }
        );
    }

    #[test]
    fn exchanging_to_failed_on_error() {
        let (state, action) = handle_event(
            exchanging(3),
            CallbackEvent::ExchangeFailed {
                attempt: 3,
                error: "invalid_grant".into(),
            },
        );
        assert_eq!(
            state,
            CallbackState::Failed {
                code: Some("abc".into()),
                error: "invalid_grant".into()
            }
        );
        assert!(matches!(action, CallbackAction::ReportFailure { .. }));
    }

    #[test]
    fn stale_attempt_result_is_discarded() {
        let (state, action) =
            handle_event(exchanging(3), CallbackEvent::ExchangeSucceeded { attempt: 2 });
        assert_eq!(state, exchanging(3));
        assert_eq!(action, CallbackAction::Discard);

        let (state, action) = handle_event(
            CallbackState::Idle,
            CallbackEvent::ExchangeFailed {
                attempt: 3,
                error: "late".into(),
            },
        );
        assert_eq!(state, CallbackState::Idle);
        assert_eq!(action, CallbackAction::Discard);
    }

    #[test]
    fn reload_while_exchanging_issues_nothing() {
        let (state, action) = handle_event(
            exchanging(1),
            CallbackEvent::ViewLoaded {
                code: Some("abc".into()),
            },
        );
        assert_eq!(state, exchanging(1));
        assert_eq!(action, CallbackAction::None);
    }

    #[test]
    fn reload_after_settling_with_same_code_is_a_no_op() {
        let established = CallbackState::Established {
            code: "abc".into(),
        };
        let (state, action) = handle_event(
            established.clone(),
            CallbackEvent::ViewLoaded {
                code: Some("abc".into()),
            },
        );
        assert_eq!(state, established);
        assert_eq!(action, CallbackAction::None);

        let failed = CallbackState::Failed {
            code: Some("abc".into()),
            error: "x".into(),
        };
        let (state, action) = handle_event(
            failed.clone(),
            CallbackEvent::ViewLoaded {
                code: Some("abc".into()),
            },
        );
        assert_eq!(state, failed);
        assert_eq!(action, CallbackAction::None);
    }

    #[test]
    fn new_code_after_failure_starts_over() {
        let (state, action) = handle_event(
            CallbackState::Failed {
                code: Some("abc".into()),
                error: "x".into(),
            },
            CallbackEvent::ViewLoaded {
                code: Some("def".into()),
            },
        );
        assert_eq!(state, awaiting());
        assert_eq!(action, CallbackAction::ReadParams);
    }

    #[test]
    fn teardown_returns_to_idle() {
        let (state, action) = handle_event(
            CallbackState::Established { code: "abc".into() },
            CallbackEvent::TornDown,
        );
        assert_eq!(state, CallbackState::Idle);
        assert_eq!(action, CallbackAction::None);
    }

    #[test]
    fn teardown_during_exchange_abandons_its_verifier() {
        let (state, action) = handle_event(exchanging(1), CallbackEvent::TornDown);
        assert_eq!(state, CallbackState::Idle);
        assert_eq!(
            action,
            CallbackAction::Abandon {
                state: "s1".into()
            }
        );
    }

    #[test]
    fn exchange_action_debug_hides_verifier() {
        let action = CallbackAction::Exchange {
            attempt: 1,
            code: "abc".into(),
            verifier: Secret::new("v-secret".into()),
        };
        assert!(!format!("{action:?}").contains("v-secret"));
    }

    // --- driver against a mock backend ---

    struct Backend {
        url: String,
        hits: Arc<AtomicU64>,
    }

    /// Start a backend whose token exchange endpoint answers after `delay`.
    async fn start_backend(status: StatusCode, body: &'static str, delay: Duration) -> Backend {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/calendar/auth",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    (status, body)
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Backend {
            url: format!("http://{addr}"),
            hits,
        }
    }

    struct Harness {
        handler: Arc<CallbackHandler>,
        storage: Arc<LocalStorage>,
        sessions: SessionStore,
        _dir: tempfile::TempDir,
    }

    async fn harness(backend: &Backend) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            LocalStorage::open(dir.path().join("storage.json"))
                .await
                .unwrap(),
        );
        let sessions = SessionStore::new(storage.clone());
        let tokens = TokenClient::new(reqwest::Client::new(), &backend.url);
        let handler = Arc::new(CallbackHandler::new(
            storage.clone(),
            sessions.clone(),
            tokens,
        ));
        Harness {
            handler,
            storage,
            sessions,
            _dir: dir,
        }
    }

    fn callback(code: Option<&str>, state: Option<&str>) -> CallbackParams {
        CallbackParams {
            code: code.map(String::from),
            state: state.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn successful_exchange_establishes_session_and_clears_verifier() {
        let backend = start_backend(StatusCode::OK, r#"{"idToken":"t1"}"#, Duration::ZERO).await;
        let h = harness(&backend).await;
        h.storage
            .set(VERIFIER_STORAGE_KEY, &pending("s1", "v1"))
            .await
            .unwrap();

        let outcome = h.handler.handle(callback(Some("abc"), Some("s1"))).await;

        assert!(matches!(outcome, CallbackOutcome::Established(_)));
        assert_eq!(outcome.redirect_to(), Some("/calendar"));
        assert!(!h.storage.contains(VERIFIER_STORAGE_KEY).await);
        assert_eq!(h.sessions.bearer_token().await.as_deref(), Some("t1"));
        assert_eq!(h.handler.status().await.phase, "established");
        assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_exchange_leaves_session_empty_and_clears_verifier() {
        let backend = start_backend(StatusCode::BAD_REQUEST, "invalid_grant", Duration::ZERO).await;
        let h = harness(&backend).await;
        h.storage
            .set(VERIFIER_STORAGE_KEY, &pending("s1", "v1"))
            .await
            .unwrap();

        let outcome = h.handler.handle(callback(Some("abc"), Some("s1"))).await;

        let CallbackOutcome::Failed(error) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("invalid_grant"), "got: {error}");
        assert!(!h.sessions.is_authenticated().await);
        assert!(!h.storage.contains(VERIFIER_STORAGE_KEY).await);

        let status = h.handler.status().await;
        assert_eq!(status.phase, "failed");
        assert!(status.error.unwrap().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn concurrent_deliveries_issue_one_exchange() {
        let backend = start_backend(
            StatusCode::OK,
            r#"{"idToken":"t1"}"#,
            Duration::from_millis(200),
        )
        .await;
        let h = harness(&backend).await;
        h.storage
            .set(VERIFIER_STORAGE_KEY, &pending("s1", "v1"))
            .await
            .unwrap();

        let first = h.handler.clone();
        let second = h.handler.clone();
        let (a, b) = tokio::join!(
            first.handle(callback(Some("abc"), Some("s1"))),
            second.handle(callback(Some("abc"), Some("s1"))),
        );

        let labels = [a.label(), b.label()];
        assert!(labels.contains(&"established"), "got {labels:?}");
        assert!(labels.contains(&"in_flight"), "got {labels:?}");
        assert_eq!(backend.hits.load(Ordering::SeqCst), 1);

        // Delivering the same code again afterwards is answered from state
        let again = h.handler.handle(callback(Some("abc"), Some("s1"))).await;
        assert!(matches!(again, CallbackOutcome::AlreadyEstablished));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_code_makes_no_network_call() {
        let backend = start_backend(StatusCode::OK, r#"{"idToken":"t1"}"#, Duration::ZERO).await;
        let h = harness(&backend).await;
        h.storage
            .set(VERIFIER_STORAGE_KEY, &pending("s1", "v1"))
            .await
            .unwrap();

        let outcome = h.handler.handle(callback(None, Some("s1"))).await;

        assert!(matches!(outcome, CallbackOutcome::Stalled(Stall::MissingCode)));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
        let status = h.handler.status().await;
        assert_eq!(status.phase, "awaiting_params");
        assert_eq!(status.stalled, Some(Stall::MissingCode));
    }

    #[tokio::test]
    async fn missing_verifier_makes_no_network_call() {
        let backend = start_backend(StatusCode::OK, r#"{"idToken":"t1"}"#, Duration::ZERO).await;
        let h = harness(&backend).await;

        let outcome = h.handler.handle(callback(Some("abc"), Some("s1"))).await;

        assert!(matches!(
            outcome,
            CallbackOutcome::Stalled(Stall::MissingVerifier)
        ));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn state_mismatch_keeps_newer_attempt_verifier() {
        let backend = start_backend(StatusCode::OK, r#"{"idToken":"t1"}"#, Duration::ZERO).await;
        let h = harness(&backend).await;
        h.storage
            .set(VERIFIER_STORAGE_KEY, &pending("newer", "v2"))
            .await
            .unwrap();

        let outcome = h.handler.handle(callback(Some("abc"), Some("older"))).await;

        assert!(matches!(outcome, CallbackOutcome::Failed(_)));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
        assert!(h.storage.contains(VERIFIER_STORAGE_KEY).await);
    }

    #[tokio::test]
    async fn result_after_reset_is_discarded() {
        let backend = start_backend(
            StatusCode::OK,
            r#"{"idToken":"t1"}"#,
            Duration::from_millis(200),
        )
        .await;
        let h = harness(&backend).await;
        h.storage
            .set(VERIFIER_STORAGE_KEY, &pending("s1", "v1"))
            .await
            .unwrap();

        let handler = h.handler.clone();
        let call = tokio::spawn(async move { handler.handle(callback(Some("abc"), Some("s1"))).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.handler.reset().await;

        let outcome = call.await.unwrap();
        assert!(matches!(outcome, CallbackOutcome::Discarded));
        assert!(!h.sessions.is_authenticated().await);
        assert_eq!(h.handler.status().await.phase, "idle");
    }

    #[tokio::test]
    async fn code_sent_before_reset_is_not_exchanged_again() {
        let backend = start_backend(
            StatusCode::OK,
            r#"{"idToken":"t1"}"#,
            Duration::from_millis(200),
        )
        .await;
        let h = harness(&backend).await;
        h.storage
            .set(VERIFIER_STORAGE_KEY, &pending("s1", "v1"))
            .await
            .unwrap();

        let handler = h.handler.clone();
        let call = tokio::spawn(async move { handler.handle(callback(Some("abc"), Some("s1"))).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.handler.reset().await;
        assert!(!h.storage.contains(VERIFIER_STORAGE_KEY).await);

        // Re-delivered while the first exchange is still outstanding
        let again = h.handler.handle(callback(Some("abc"), Some("s1"))).await;
        assert!(matches!(again, CallbackOutcome::Stalled(Stall::MissingVerifier)));

        assert!(matches!(call.await.unwrap(), CallbackOutcome::Discarded));

        // And once more after it settled
        let again = h.handler.handle(callback(Some("abc"), Some("s1"))).await;
        assert!(matches!(again, CallbackOutcome::Stalled(Stall::MissingVerifier)));
        assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
        assert!(!h.sessions.is_authenticated().await);
    }

    #[tokio::test]
    async fn reset_then_logout_is_never_undone_by_the_exchange() {
        // Sweep the reset across the exchange's whole lifetime.
        for reset_after_ms in (0..40).step_by(5) {
            let backend = start_backend(
                StatusCode::OK,
                r#"{"idToken":"t1"}"#,
                Duration::from_millis(25),
            )
            .await;
            let h = harness(&backend).await;
            h.storage
                .set(VERIFIER_STORAGE_KEY, &pending("s1", "v1"))
                .await
                .unwrap();

            let handler = h.handler.clone();
            let call =
                tokio::spawn(async move { handler.handle(callback(Some("abc"), Some("s1"))).await });
            while backend.hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            tokio::time::sleep(Duration::from_millis(reset_after_ms)).await;
            h.handler.reset().await;
            h.sessions.logout().await.unwrap();

            call.await.unwrap();
            assert!(
                !h.sessions.is_authenticated().await,
                "session reinstated after logout (reset at {reset_after_ms}ms)"
            );
        }
    }
}
