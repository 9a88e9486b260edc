//! Sign-in endpoints
//!
//! Endpoints:
//! - GET  /auth/login    — start PKCE sign-in, 303 to the identity provider
//! - GET  /auth/callback — provider redirect target, 303 to /calendar on success
//! - GET  /auth/status   — session and callback status
//! - POST /auth/logout   — forget the session and any pending sign-in

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::{info, instrument};

use alarm_api::AlarmBook;
use alarm_auth::{CallbackOutcome, CallbackParams, LANDING_PATH, LOGIN_PATH, begin_authorization};

use crate::AppState;
use crate::error::ApiError;
use crate::metrics;
use crate::request;

/// GET /auth/login — store a fresh verifier and send the browser to the
/// provider's authorize endpoint.
#[instrument(skip_all, fields(request_id = %request::current()))]
pub async fn login(State(state): State<AppState>) -> Result<Redirect, ApiError> {
    let redirect = begin_authorization(&state.storage, &state.identity).await?;
    metrics::record_login_started();
    Ok(Redirect::to(redirect.url.as_str()))
}

/// GET /auth/callback
///
/// Every load goes through the callback handler, so a reload or a second
/// tab delivering the same code never triggers a second exchange.
#[instrument(skip_all, fields(request_id = %request::current()))]
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, ApiError> {
    let outcome = state.callback.handle(params).await;
    metrics::record_callback(outcome.label());

    match outcome {
        CallbackOutcome::Established(session) => {
            // A different user may have signed in; drop the old alarm view.
            *state.alarms.write().await = AlarmBook::new();
            info!(user_id = %session.user.id, "signed in");
            Ok(Redirect::to(LANDING_PATH).into_response())
        }
        CallbackOutcome::AlreadyEstablished => Ok(Redirect::to(LANDING_PATH).into_response()),
        CallbackOutcome::InFlight => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "in_flight",
                "message": "sign-in is being completed, reload shortly",
            })),
        )
            .into_response()),
        CallbackOutcome::Stalled(stall) => Err(ApiError::SignInStalled(stall.message().into())),
        CallbackOutcome::Failed(error) => Err(ApiError::SignInFailed(error)),
        CallbackOutcome::Discarded => Err(ApiError::Conflict(
            "sign-in was cancelled; please restart sign-in".into(),
        )),
    }
}

/// GET /auth/status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.sessions.current().await;
    let callback = state.callback.status().await;
    Json(serde_json::json!({
        "authenticated": session.is_some(),
        "user": session.as_ref().map(|s| &s.user),
        "expires_at_ms": session.as_ref().and_then(|s| s.expires_at_ms),
        "callback": callback,
        "login_url": LOGIN_PATH,
    }))
}

/// POST /auth/logout
///
/// The callback handler is reset first so an exchange still in flight
/// cannot install a session after it was cleared.
#[instrument(skip_all, fields(request_id = %request::current()))]
pub async fn logout(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.callback.reset().await;
    state.sessions.logout().await?;
    info!("signed out");
    *state.alarms.write().await = AlarmBook::new();
    Ok(Json(serde_json::json!({
        "status": "signed_out",
        "login_url": LOGIN_PATH,
    })))
}
