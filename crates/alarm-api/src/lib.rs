//! Calendar, alarm and activity collaborators of the alarm client
//!
//! `client::BackendClient` talks to the backend; the other modules hold the
//! view logic the client applies to what comes back:
//! - `calendar`: provider events mapped, searched and grouped by day
//! - `book`: per-event alarm status with command/result toggling
//! - `activity`: trigger history filters, statistics and CSV export

pub mod activity;
pub mod alarm;
pub mod book;
pub mod calendar;
pub mod client;
pub mod error;

pub use activity::{ActivityFilter, ActivityStatistics, ActivityStatus, AlarmActivity};
pub use alarm::{AlarmSettings, AlarmSpec, CreateAlarmResponse};
pub use book::{AlarmBook, AlarmCall, AlarmCommand, AlarmOutcome, AlarmStatus, EventView};
pub use calendar::{CalendarEvent, ProviderEvent, filter_events, group_by_date, map_events};
pub use client::BackendClient;
pub use error::{Error, Result};
