//! Backend HTTP client for calendar, alarm and activity calls
//!
//! Every call carries the session's bearer token. A 401/403 from the backend
//! is reported as `Error::Unauthorized` so callers can send the user back to
//! sign-in; other non-2xx answers surface the response body.

use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::activity::{ActivitiesResponse, AlarmActivity};
use crate::alarm::{AlarmSpec, CreateAlarmRequest, CreateAlarmResponse, DeleteAlarmRequest};
use crate::calendar::{EventsResponse, ProviderEvent};
use crate::error::{Error, Result};

pub const CALENDAR_PATH: &str = "/calendar";
pub const ALARM_PATH: &str = "/alarm";
pub const ACTIVITY_PATH: &str = "/activity";

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    /// `base_url` is the API base (e.g. `https://api.example.com/prod`).
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /calendar`: the user's upcoming provider events.
    #[instrument(skip_all)]
    pub async fn list_events(&self, bearer: &str) -> Result<Vec<ProviderEvent>> {
        let request = self.http.get(self.url(CALENDAR_PATH)).bearer_auth(bearer);
        let body: EventsResponse = decode(send(request).await?).await?;
        debug!(events = body.events.len(), "loaded calendar events");
        Ok(body.events)
    }

    /// `POST /alarm`: schedule an alarm, returning the schedule handle
    /// needed to delete it later.
    #[instrument(skip_all)]
    pub async fn create_alarm(&self, bearer: &str, spec: &AlarmSpec) -> Result<CreateAlarmResponse> {
        let request = self
            .http
            .post(self.url(ALARM_PATH))
            .bearer_auth(bearer)
            .json(&CreateAlarmRequest::new(spec)?);
        let created: CreateAlarmResponse = decode(send(request).await?).await?;
        if created.schedule_name.is_empty() {
            return Err(Error::Decode("create response carried an empty schedule_name".into()));
        }
        debug!(schedule_name = %created.schedule_name, "alarm scheduled");
        Ok(created)
    }

    /// `DELETE /alarm`: cancel the schedule created for `event_id`.
    #[instrument(skip_all, fields(event_id = %event_id))]
    pub async fn delete_alarm(&self, bearer: &str, event_id: &str, schedule_name: &str) -> Result<()> {
        let request = self
            .http
            .delete(self.url(ALARM_PATH))
            .bearer_auth(bearer)
            .json(&DeleteAlarmRequest {
                event_id,
                schedule_name,
            });
        send(request).await?;
        Ok(())
    }

    /// `GET /activity`: alarm trigger history.
    #[instrument(skip_all)]
    pub async fn list_activities(&self, bearer: &str) -> Result<Vec<AlarmActivity>> {
        let request = self.http.get(self.url(ACTIVITY_PATH)).bearer_auth(bearer);
        let body: ActivitiesResponse = decode(send(request).await?).await?;
        debug!(activities = body.activities.len(), "loaded activity history");
        Ok(body.activities)
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::Http(format!("backend request failed: {e}")))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(Error::Unauthorized(format!("backend returned {status}: {body}")))
    } else {
        Err(Error::Backend(format!("backend returned {status}: {body}")))
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| Error::Decode(e.to_string()))
}
