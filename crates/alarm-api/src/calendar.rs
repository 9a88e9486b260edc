//! Calendar events as the client shows them
//!
//! The backend relays provider events (`summary`, `start.dateTime`, ...).
//! They are mapped once into `CalendarEvent` and everything downstream
//! (search, grouping, alarms) works on that.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Title used when the provider event has no summary.
pub const UNTITLED_EVENT: &str = "No title";

/// An event as relayed by the backend from the calendar provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start: Option<ProviderTime>,
    #[serde(default)]
    pub end: Option<ProviderTime>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTime {
    #[serde(default)]
    pub date_time: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

impl ProviderTime {
    fn parse(&self) -> Option<DateTime<FixedOffset>> {
        self.date_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    }
}

/// Body of `GET /calendar`.
#[derive(Debug, Deserialize)]
pub(crate) struct EventsResponse {
    #[serde(default)]
    pub events: Vec<ProviderEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: DateTime<FixedOffset>,
    pub description: String,
}

impl CalendarEvent {
    /// Map a provider event. All-day events and events with an unreadable
    /// start carry no `dateTime` and are skipped.
    pub fn from_provider(event: ProviderEvent) -> Option<Self> {
        let Some(start_time) = event.start.as_ref().and_then(ProviderTime::parse) else {
            warn!(event_id = %event.id, "skipping event without a usable start.dateTime");
            return None;
        };
        let end_time = event
            .end
            .as_ref()
            .and_then(ProviderTime::parse)
            .unwrap_or(start_time);

        Some(Self {
            id: event.id,
            title: event
                .summary
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| UNTITLED_EVENT.to_string()),
            start_time,
            end_time,
            description: event.description.unwrap_or_default(),
        })
    }

    /// Calendar date of the start as seen in `zone`.
    pub fn local_date(&self, zone: Tz) -> NaiveDate {
        self.start_time.with_timezone(&zone).date_naive()
    }

    fn matches(&self, needle: &str) -> bool {
        self.title.to_lowercase().contains(needle)
            || self.description.to_lowercase().contains(needle)
    }
}

/// Map provider events, dropping the unusable ones, ordered by start.
pub fn map_events(events: Vec<ProviderEvent>) -> Vec<CalendarEvent> {
    let mut mapped: Vec<CalendarEvent> = events
        .into_iter()
        .filter_map(CalendarEvent::from_provider)
        .collect();
    mapped.sort_by_key(|e| e.start_time);
    mapped
}

/// Case-insensitive substring search over title and description.
/// An empty (or all-whitespace) query keeps everything.
pub fn filter_events<'a>(events: &'a [CalendarEvent], query: &str) -> Vec<&'a CalendarEvent> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return events.iter().collect();
    }
    events.iter().filter(|e| e.matches(&needle)).collect()
}

/// Group events by their calendar date in `zone`, dates ascending, each
/// day in start order.
pub fn group_by_date<'a, I>(events: I, zone: Tz) -> BTreeMap<NaiveDate, Vec<&'a CalendarEvent>>
where
    I: IntoIterator<Item = &'a CalendarEvent>,
{
    let mut groups: BTreeMap<NaiveDate, Vec<&'a CalendarEvent>> = BTreeMap::new();
    for event in events {
        groups.entry(event.local_date(zone)).or_default().push(event);
    }
    for day in groups.values_mut() {
        day.sort_by_key(|e| e.start_time);
    }
    groups
}
