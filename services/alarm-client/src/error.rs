//! HTTP-facing error type
//!
//! Every handler error ends up here and is rendered as
//! `{"error":{"type":...,"message":...,"request_id":...}}`. Errors that the
//! user resolves by signing in again also carry `login_url`.

use alarm_auth::LOGIN_PATH;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

use crate::request;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("sign in to continue")]
    Unauthenticated,

    /// The callback cannot proceed; sign-in must restart
    #[error("{0}")]
    SignInStalled(String),

    #[error("sign-in failed: {0}")]
    SignInFailed(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("backend unavailable: {0}")]
    BadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::SignInStalled(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SignInFailed(_) | ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::SignInStalled(_) => "sign_in_stalled",
            ApiError::SignInFailed(_) => "sign_in_failed",
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::BadGateway(_) => "backend_error",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn restarts_sign_in(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthenticated | ApiError::SignInStalled(_) | ApiError::SignInFailed(_)
        )
    }
}

impl From<alarm_auth::Error> for ApiError {
    fn from(err: alarm_auth::Error) -> Self {
        use alarm_auth::Error as E;
        match err {
            E::Randomness(_) => ApiError::Internal(format!("cannot start sign-in: {err}")),
            E::Http(_) | E::TokenExchange(_) => ApiError::BadGateway(err.to_string()),
            E::InvalidRequest(_) | E::StorageParse(_) | E::Io(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<alarm_api::Error> for ApiError {
    fn from(err: alarm_api::Error) -> Self {
        use alarm_api::Error as E;
        match err {
            E::Unauthorized(_) => ApiError::Unauthenticated,
            E::Http(_) | E::Backend(_) | E::Decode(_) => ApiError::BadGateway(err.to_string()),
            E::UnknownEvent(_) => ApiError::NotFound(err.to_string()),
            E::Conflict(_) => ApiError::Conflict(err.to_string()),
            E::InvalidSettings(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let request_id = request::current();
        if status.is_server_error() {
            warn!(request_id, error = %self, "request failed");
        }

        let mut error = serde_json::json!({
            "type": self.kind(),
            "message": self.to_string(),
            "request_id": request_id,
        });
        if self.restarts_sign_in() {
            error["login_url"] = serde_json::Value::from(LOGIN_PATH);
        }

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": error }).to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn error_body_has_type_message_and_request_id() {
        let (status, json) = body_json(ApiError::NotFound("event not found: e9".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["type"], "not_found");
        assert_eq!(json["error"]["message"], "event not found: e9");
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
        assert!(json["error"].get("login_url").is_none());
    }

    #[tokio::test]
    async fn sign_in_errors_point_to_login() {
        let (status, json) = body_json(ApiError::Unauthenticated).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["login_url"], "/auth/login");

        let (status, json) = body_json(ApiError::SignInFailed("invalid_grant".into())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["login_url"], "/auth/login");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("invalid_grant")
        );
    }

    #[test]
    fn backend_rejection_means_sign_in_again() {
        let err: ApiError = alarm_api::Error::Unauthorized("401".into()).into();
        assert!(matches!(err, ApiError::Unauthenticated));

        let err: ApiError = alarm_api::Error::InvalidSettings("alarm_interval".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn randomness_failure_cannot_start_sign_in() {
        let err: ApiError = alarm_auth::Error::Randomness("no entropy".into()).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("cannot start sign-in"));
    }
}
