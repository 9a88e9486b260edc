//! Backend token exchange
//!
//! The backend, not this client, talks to the identity provider's token
//! endpoint. We hand it the authorization code plus the PKCE verifier on
//! `POST /calendar/auth` and get session material back.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::constants::TOKEN_EXCHANGE_PATH;
use crate::error::{Error, Result};

/// Session material returned by a successful exchange.
///
/// The backend answers in camelCase (`idToken`); snake_case spellings are
/// accepted too. Anything else in the body is kept in `extra`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenExchangeResponse {
    #[serde(alias = "id_token")]
    pub id_token: String,
    #[serde(default, alias = "access_token")]
    pub access_token: Option<String>,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    /// Seconds until the ID token expires (delta, not absolute)
    #[serde(default, alias = "expires_in")]
    pub expires_in: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    code: &'a str,
    code_verifier: &'a str,
}

/// HTTP client for the backend token exchange endpoint.
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    endpoint: String,
}

impl TokenClient {
    /// `backend_url` is the API base (e.g. `https://api.example.com/prod`).
    pub fn new(http: reqwest::Client, backend_url: &str) -> Self {
        Self {
            http,
            endpoint: format!(
                "{}{}",
                backend_url.trim_end_matches('/'),
                TOKEN_EXCHANGE_PATH
            ),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Exchange an authorization code and its verifier for a session.
    ///
    /// `bearer` is the token of an already established session, if any; the
    /// backend links the calendar grant to that user.
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        bearer: Option<&str>,
    ) -> Result<TokenExchangeResponse> {
        let mut request = self.http.post(&self.endpoint).json(&ExchangeRequest {
            code,
            code_verifier: verifier,
        });
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::TokenExchange(format!(
                "backend returned {status}: {body}"
            )));
        }

        let tokens = response
            .json::<TokenExchangeResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid exchange response: {e}")))?;
        debug!(
            has_access_token = tokens.access_token.is_some(),
            "token exchange succeeded"
        );
        Ok(tokens)
    }
}
