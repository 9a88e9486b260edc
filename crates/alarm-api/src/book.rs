//! Per-event alarm status
//!
//! Toggling an alarm is a command/result exchange with the backend. The
//! event is marked `Pending` while the call is outstanding and only moves to
//! `Enabled`/`Disabled` once the backend answers:
//!
//! ```text
//! Disabled --begin(Enable)--> Pending --confirm(Ok)--> Enabled
//! Enabled --begin(Disable)--> Pending --confirm(Ok)--> Disabled
//!                             Pending --confirm(Err)-> previous status
//! ```

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alarm::AlarmSettings;
use crate::calendar::CalendarEvent;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AlarmStatus {
    Disabled,
    Pending,
    Enabled { schedule_name: String },
}

impl AlarmStatus {
    pub fn label(&self) -> &'static str {
        match self {
            AlarmStatus::Disabled => "disabled",
            AlarmStatus::Pending => "pending",
            AlarmStatus::Enabled { .. } => "enabled",
        }
    }
}

/// What the user asked for.
#[derive(Debug, Clone)]
pub enum AlarmCommand {
    Enable(AlarmSettings),
    Disable,
}

/// The backend call `begin` hands back for the caller to make.
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmCall {
    Create {
        event: CalendarEvent,
        settings: AlarmSettings,
    },
    Delete {
        event_id: String,
        schedule_name: String,
    },
}

/// What the backend answered for an `AlarmCall`.
#[derive(Debug, Clone)]
pub enum AlarmOutcome {
    Created { schedule_name: String },
    Deleted,
}

#[derive(Debug, Clone)]
struct EventAlarm {
    status: AlarmStatus,
    settings: AlarmSettings,
    /// Status to restore if the outstanding call fails
    previous: Option<AlarmStatus>,
    /// Settings to keep if an outstanding create fails
    previous_settings: Option<AlarmSettings>,
}

impl Default for EventAlarm {
    fn default() -> Self {
        Self {
            status: AlarmStatus::Disabled,
            settings: AlarmSettings::default(),
            previous: None,
            previous_settings: None,
        }
    }
}

/// An event with its alarm, as shown in the calendar view.
#[derive(Debug, Clone, Serialize)]
pub struct EventView {
    #[serde(flatten)]
    pub event: CalendarEvent,
    pub alarm: AlarmStatus,
    pub settings: AlarmSettings,
}

/// The loaded events and their alarm state.
#[derive(Debug, Default)]
pub struct AlarmBook {
    events: Vec<CalendarEvent>,
    alarms: HashMap<String, EventAlarm>,
}

impl AlarmBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the event list after a calendar reload. Events that are still
    /// present keep their alarm status and settings; the rest are forgotten,
    /// except those with a change in flight, which stay until it settles.
    pub fn replace_events(&mut self, mut events: Vec<CalendarEvent>) {
        let mut alarms = HashMap::with_capacity(events.len());
        for event in &events {
            let alarm = self.alarms.remove(&event.id).unwrap_or_default();
            alarms.insert(event.id.clone(), alarm);
        }
        for event in std::mem::take(&mut self.events) {
            let Some(alarm) = self
                .alarms
                .remove(&event.id)
                .filter(|a| a.status == AlarmStatus::Pending)
            else {
                continue;
            };
            debug!(event_id = %event.id, "keeping vanished event until its alarm change settles");
            alarms.insert(event.id.clone(), alarm);
            events.push(event);
        }
        if !self.alarms.is_empty() {
            debug!(dropped = self.alarms.len(), "forgetting alarms of vanished events");
        }
        self.events = events;
        self.alarms = alarms;
    }

    pub fn events(&self) -> &[CalendarEvent] {
        &self.events
    }

    pub fn event(&self, event_id: &str) -> Option<&CalendarEvent> {
        self.events.iter().find(|e| e.id == event_id)
    }

    pub fn status(&self, event_id: &str) -> Option<&AlarmStatus> {
        self.alarms.get(event_id).map(|a| &a.status)
    }

    pub fn settings(&self, event_id: &str) -> Option<&AlarmSettings> {
        self.alarms.get(event_id).map(|a| &a.settings)
    }

    pub fn view(&self, event: &CalendarEvent) -> EventView {
        let alarm = self.alarms.get(&event.id).cloned().unwrap_or_default();
        EventView {
            event: event.clone(),
            alarm: alarm.status,
            settings: alarm.settings,
        }
    }

    /// Change the stored settings of an event without touching its alarm.
    pub fn update_settings(&mut self, event_id: &str, settings: AlarmSettings) -> Result<()> {
        settings.validate()?;
        let alarm = self.alarm_mut(event_id)?;
        if alarm.status == AlarmStatus::Pending {
            return Err(Error::Conflict(format!(
                "alarm for {event_id} has a change in flight"
            )));
        }
        alarm.settings = settings;
        Ok(())
    }

    /// Mark the event `Pending` and return the backend call to make.
    pub fn begin(&mut self, event_id: &str, command: AlarmCommand) -> Result<AlarmCall> {
        let event = self
            .event(event_id)
            .cloned()
            .ok_or_else(|| Error::UnknownEvent(event_id.to_string()))?;
        let alarm = self.alarm_mut(event_id)?;

        let call = match command {
            _ if alarm.status == AlarmStatus::Pending => {
                return Err(Error::Conflict(format!(
                    "alarm for {event_id} has a change in flight"
                )));
            }
            AlarmCommand::Enable(settings) => {
                if alarm.status != AlarmStatus::Disabled {
                    return Err(Error::Conflict(format!(
                        "alarm for {event_id} is already enabled"
                    )));
                }
                settings.validate()?;
                alarm.previous_settings =
                    Some(std::mem::replace(&mut alarm.settings, settings.clone()));
                AlarmCall::Create { event, settings }
            }
            AlarmCommand::Disable => {
                let AlarmStatus::Enabled { schedule_name } = &alarm.status else {
                    return Err(Error::Conflict(format!("alarm for {event_id} is not enabled")));
                };
                AlarmCall::Delete {
                    event_id: event_id.to_string(),
                    schedule_name: schedule_name.clone(),
                }
            }
        };

        alarm.previous = Some(std::mem::replace(&mut alarm.status, AlarmStatus::Pending));
        debug!(event_id, "alarm change pending");
        Ok(call)
    }

    /// Apply the backend's answer to the call `begin` returned.
    ///
    /// On failure the event goes back to the status it had before `begin`.
    pub fn confirm(
        &mut self,
        event_id: &str,
        result: std::result::Result<AlarmOutcome, String>,
    ) -> Result<&AlarmStatus> {
        let alarm = self.alarm_mut(event_id)?;
        if alarm.status != AlarmStatus::Pending {
            return Err(Error::Conflict(format!(
                "alarm for {event_id} has no change in flight"
            )));
        }
        let previous = alarm.previous.take().unwrap_or(AlarmStatus::Disabled);
        let previous_settings = alarm.previous_settings.take();

        alarm.status = match result {
            Ok(AlarmOutcome::Created { schedule_name }) => {
                info!(event_id, schedule_name = %schedule_name, "alarm enabled");
                AlarmStatus::Enabled { schedule_name }
            }
            Ok(AlarmOutcome::Deleted) => {
                info!(event_id, "alarm disabled");
                AlarmStatus::Disabled
            }
            Err(error) => {
                warn!(event_id, error = %error, "alarm change failed, restoring previous status");
                if let Some(settings) = previous_settings {
                    alarm.settings = settings;
                }
                previous
            }
        };
        Ok(&alarm.status)
    }

    fn alarm_mut(&mut self, event_id: &str) -> Result<&mut EventAlarm> {
        self.alarms
            .get_mut(event_id)
            .ok_or_else(|| Error::UnknownEvent(event_id.to_string()))
    }
}
