//! Per-request correlation id
//!
//! The `assign` middleware mints a `req_<uuid>` id for every request and
//! returns it in `x-request-id`. While the request is served, `current()`
//! yields the same id, so handler spans and error bodies agree with the
//! header.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

fn mint() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Id of the request being served; a fresh one outside `assign`.
pub fn current() -> String {
    REQUEST_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| mint())
}

pub async fn assign(request: Request, next: Next) -> Response {
    let request_id = mint();
    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
