//! Sign-in for the alarm client
//!
//! PKCE authorization against the identity provider, with the code exchanged
//! by the backend. This crate has no dependency on the client binary and can
//! be tested on its own.
//!
//! Sign-in flow:
//! 1. `redirect::begin_authorization()` stores a verifier bound to a fresh
//!    `state` and returns the provider URL carrying the S256 challenge
//! 2. The provider redirects back with `code` and `state`
//! 3. `callback::CallbackHandler::handle()` checks them against the stored
//!    attempt and calls `token::TokenClient::exchange_code()` once per code
//! 4. `session::SessionStore::establish()` installs and persists the session
//! 5. On restart, `SessionStore::refresh()` recovers it from storage

pub mod callback;
pub mod constants;
pub mod error;
pub mod pkce;
pub mod redirect;
pub mod session;
pub mod storage;
pub mod token;

pub use callback::{CallbackHandler, CallbackOutcome, CallbackParams, CallbackStatus, Stall};
pub use constants::*;
pub use error::{Error, Result};
pub use pkce::{compute_challenge, generate_state, generate_verifier};
pub use redirect::{AuthorizationRedirect, IdentityProvider, PendingAuthorization, begin_authorization};
pub use session::{Session, SessionStore, User};
pub use storage::LocalStorage;
pub use token::{TokenClient, TokenExchangeResponse};
