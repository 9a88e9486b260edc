//! Signed-in views: calendar, alarms and activity
//!
//! Every handler here needs a session; without one it answers 401 with the
//! login URL. A backend that rejects the session's token signs the user out.

use std::future::Future;
use std::time::Instant;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use alarm_api::activity::{export_file_name, to_csv};
use alarm_api::{
    ActivityFilter, ActivityStatistics, ActivityStatus, AlarmActivity, AlarmBook, AlarmCall,
    AlarmCommand, AlarmOutcome, AlarmSettings, AlarmSpec, EventView, filter_events,
    group_by_date, map_events,
};

use crate::AppState;
use crate::error::ApiError;
use crate::metrics;
use crate::request;

async fn require_session(state: &AppState) -> Result<String, ApiError> {
    state
        .sessions
        .bearer_token()
        .await
        .ok_or(ApiError::Unauthenticated)
}

/// Await one backend call and record it. An `Unauthorized` answer ends the
/// session.
async fn backend_call<T>(
    state: &AppState,
    endpoint: &'static str,
    call: impl Future<Output = alarm_api::Result<T>>,
) -> Result<T, ApiError> {
    let started = Instant::now();
    let result = call.await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::record_backend_request(endpoint, outcome, started.elapsed().as_secs_f64());

    match result {
        Ok(value) => Ok(value),
        Err(alarm_api::Error::Unauthorized(msg)) => {
            warn!(endpoint, error = %msg, "backend rejected the session, signing out");
            state.callback.reset().await;
            if let Err(e) = state.sessions.logout().await {
                warn!(error = %e, "failed to clear rejected session");
            }
            *state.alarms.write().await = AlarmBook::new();
            Err(ApiError::Unauthenticated)
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CalendarQuery {
    #[serde(default)]
    pub q: String,
}

/// GET /calendar?q= — reload events, then search and group them by day.
#[instrument(skip_all, fields(request_id = %request::current()))]
pub async fn calendar(
    State(state): State<AppState>,
    Query(query): Query<CalendarQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let bearer = require_session(&state).await?;
    let events = backend_call(&state, "calendar", state.backend.list_events(&bearer)).await?;

    let mut book = state.alarms.write().await;
    book.replace_events(map_events(events));
    let book = &*book;

    let matched = filter_events(book.events(), &query.q);
    let total = matched.len();
    let days: Vec<serde_json::Value> = group_by_date(matched, state.time_zone)
        .into_iter()
        .map(|(date, events)| {
            let events: Vec<EventView> = events.into_iter().map(|e| book.view(e)).collect();
            serde_json::json!({ "date": date, "events": events })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "query": query.q,
        "total": total,
        "days": days,
    })))
}

#[derive(Debug, Deserialize)]
pub struct EnableAlarm {
    pub event_id: String,
    /// Falls back to the event's stored settings
    #[serde(default)]
    pub settings: Option<AlarmSettings>,
}

#[derive(Debug, Deserialize)]
pub struct DisableAlarm {
    pub event_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettings {
    pub event_id: String,
    pub settings: AlarmSettings,
}

/// POST /alarm
#[instrument(skip_all, fields(request_id = %request::current()))]
pub async fn enable_alarm(
    State(state): State<AppState>,
    Json(request): Json<EnableAlarm>,
) -> Result<Json<EventView>, ApiError> {
    let bearer = require_session(&state).await?;
    let call = {
        let mut book = state.alarms.write().await;
        let settings = match request.settings {
            Some(settings) => settings,
            None => book
                .settings(&request.event_id)
                .cloned()
                .unwrap_or_default(),
        };
        book.begin(&request.event_id, AlarmCommand::Enable(settings))?
    };
    run_alarm_call(&state, &bearer, &request.event_id, call).await
}

/// DELETE /alarm
#[instrument(skip_all, fields(request_id = %request::current()))]
pub async fn disable_alarm(
    State(state): State<AppState>,
    Json(request): Json<DisableAlarm>,
) -> Result<Json<EventView>, ApiError> {
    let bearer = require_session(&state).await?;
    let call = state
        .alarms
        .write()
        .await
        .begin(&request.event_id, AlarmCommand::Disable)?;
    run_alarm_call(&state, &bearer, &request.event_id, call).await
}

/// Make the backend call `AlarmBook::begin` asked for and feed the answer
/// back. The book lock is not held across the call.
async fn run_alarm_call(
    state: &AppState,
    bearer: &str,
    event_id: &str,
    call: AlarmCall,
) -> Result<Json<EventView>, ApiError> {
    let result = match call {
        AlarmCall::Create { event, settings } => {
            let spec = AlarmSpec::new(&event, &settings, state.time_zone.name());
            backend_call(state, "alarm_create", state.backend.create_alarm(bearer, &spec))
                .await
                .map(|created| AlarmOutcome::Created {
                    schedule_name: created.schedule_name,
                })
        }
        AlarmCall::Delete {
            event_id,
            schedule_name,
        } => backend_call(
            state,
            "alarm_delete",
            state.backend.delete_alarm(bearer, &event_id, &schedule_name),
        )
        .await
        .map(|()| AlarmOutcome::Deleted),
    };

    let mut book = state.alarms.write().await;
    match result {
        Ok(outcome) => {
            let confirmed = book.confirm(event_id, Ok(outcome.clone())).map(|_| ());
            if let Err(e) = confirmed {
                drop(book);
                return Err(match outcome {
                    AlarmOutcome::Created { schedule_name } => {
                        cancel_untracked(state, bearer, event_id, &schedule_name).await
                    }
                    AlarmOutcome::Deleted => e.into(),
                });
            }
        }
        Err(err) => {
            // The book is gone if the failure signed the user out.
            if let Err(e) = book.confirm(event_id, Err(err.to_string())) {
                debug!(event_id, error = %e, "no pending alarm left to restore");
            }
            return Err(err);
        }
    }
    let event = book
        .event(event_id)
        .ok_or_else(|| ApiError::NotFound(format!("event not found: {event_id}")))?;
    Ok(Json(book.view(event)))
}

/// The backend created an alarm the book no longer tracks, because the book
/// was reset while the call was out. Delete it again so no alarm fires that
/// the user cannot see or turn off.
async fn cancel_untracked(
    state: &AppState,
    bearer: &str,
    event_id: &str,
    schedule_name: &str,
) -> ApiError {
    warn!(event_id, schedule_name, "alarm created for an untracked event, deleting it");
    let deleted = backend_call(
        state,
        "alarm_delete",
        state.backend.delete_alarm(bearer, event_id, schedule_name),
    )
    .await;
    match deleted {
        Ok(()) => ApiError::Conflict(format!(
            "alarm for {event_id} was cancelled because the calendar was reset; enable it again"
        )),
        Err(e) => {
            warn!(event_id, schedule_name, error = %e, "failed to delete untracked alarm");
            ApiError::Conflict(format!(
                "alarm for {event_id} was created as {schedule_name} after the calendar was reset \
                 and could not be cancelled"
            ))
        }
    }
}

/// PUT /alarm/settings — change an event's settings without a backend call.
#[instrument(skip_all, fields(request_id = %request::current()))]
pub async fn update_settings(
    State(state): State<AppState>,
    Json(request): Json<UpdateSettings>,
) -> Result<Json<EventView>, ApiError> {
    require_session(&state).await?;
    let mut book = state.alarms.write().await;
    book.update_settings(&request.event_id, request.settings)?;
    let event = book
        .event(&request.event_id)
        .ok_or_else(|| ApiError::NotFound(format!("event not found: {}", request.event_id)))?;
    Ok(Json(book.view(event)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub status: Option<ActivityStatus>,
}

impl ActivityQuery {
    fn filter(&self) -> Result<ActivityFilter, ApiError> {
        if let (Some(start), Some(end)) = (self.start, self.end)
            && start > end
        {
            return Err(ApiError::BadRequest(format!(
                "start ({start}) must not be after end ({end})"
            )));
        }
        Ok(ActivityFilter::from_dates(
            self.start,
            self.end,
            self.status,
            Utc::now(),
        ))
    }
}

async fn load_activities(
    state: &AppState,
    query: &ActivityQuery,
) -> Result<(ActivityFilter, Vec<AlarmActivity>), ApiError> {
    let bearer = require_session(state).await?;
    let filter = query.filter()?;
    let activities =
        backend_call(state, "activity", state.backend.list_activities(&bearer)).await?;
    Ok((filter, activities))
}

/// GET /activity?start=&end=&status=
#[instrument(skip_all, fields(request_id = %request::current()))]
pub async fn activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (filter, activities) = load_activities(&state, &query).await?;
    let hits = filter.apply(&activities);
    let statistics = ActivityStatistics::compute(hits.iter().copied());

    Ok(Json(serde_json::json!({
        "filter": {
            "start": filter.start,
            "end": filter.end,
            "status": filter.status,
        },
        "statistics": statistics,
        "activities": hits,
    })))
}

/// GET /activity/export.csv — the filtered activities as a download.
#[instrument(skip_all, fields(request_id = %request::current()))]
pub async fn export_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (filter, activities) = load_activities(&state, &query).await?;
    let hits = filter.apply(&activities);
    let disposition = format!(
        "attachment; filename=\"{}\"",
        export_file_name(Utc::now().date_naive())
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        to_csv(hits),
    ))
}
