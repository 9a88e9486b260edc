//! Alarm settings and the backend alarm payloads

use serde::{Deserialize, Serialize};

use crate::calendar::CalendarEvent;
use crate::error::{Error, Result};

/// Minutes between alarm repeats offered to the user.
pub const ALARM_INTERVALS: &[u32] = &[1, 3, 5, 10, 15];

/// Repeat counts offered to the user.
pub const ALARM_REPEAT_TIMES: &[u32] = &[1, 2, 3, 5, 10];

/// Remedial actions attached to one event's alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmSettings {
    #[serde(default)]
    pub spray_flag: bool,
    /// Custom voice prompt; empty means the default prompt
    #[serde(default)]
    pub user_prompt: String,
    pub alarm_interval: u32,
    pub alarm_repeat_times: u32,
    /// Escalation email recipients
    #[serde(default)]
    pub receivers: Vec<String>,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            spray_flag: false,
            user_prompt: String::new(),
            alarm_interval: 5,
            alarm_repeat_times: 3,
            receivers: Vec::new(),
        }
    }
}

impl AlarmSettings {
    /// Check the settings against what the alarm scheduler accepts.
    pub fn validate(&self) -> Result<()> {
        if !ALARM_INTERVALS.contains(&self.alarm_interval) {
            return Err(Error::InvalidSettings(format!(
                "alarm_interval must be one of {ALARM_INTERVALS:?} minutes, got {}",
                self.alarm_interval
            )));
        }
        if !ALARM_REPEAT_TIMES.contains(&self.alarm_repeat_times) {
            return Err(Error::InvalidSettings(format!(
                "alarm_repeat_times must be one of {ALARM_REPEAT_TIMES:?}, got {}",
                self.alarm_repeat_times
            )));
        }
        for (i, receiver) in self.receivers.iter().enumerate() {
            if !is_valid_email(receiver) {
                return Err(Error::InvalidSettings(format!(
                    "receiver {receiver:?} is not a valid email address"
                )));
            }
            if self.receivers[..i].contains(receiver) {
                return Err(Error::InvalidSettings(format!(
                    "receiver {receiver:?} is listed twice"
                )));
            }
        }
        Ok(())
    }
}

/// `local@domain.tld`: no whitespace, exactly one `@`, a dot inside the
/// domain with text on both sides.
fn is_valid_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlarmStart {
    date_time: String,
    time_zone: String,
}

/// The event description the alarm scheduler receives.
#[derive(Debug, Serialize)]
pub struct AlarmSpec {
    id: String,
    start: AlarmStart,
    spray_flag: bool,
    user_prompt: String,
    alarm_interval: u32,
    alarm_repeat_times: u32,
    receivers: Vec<String>,
}

impl AlarmSpec {
    /// `time_zone` is the IANA zone the scheduler resolves the start in.
    pub fn new(event: &CalendarEvent, settings: &AlarmSettings, time_zone: &str) -> Self {
        Self {
            id: event.id.clone(),
            start: AlarmStart {
                date_time: event.start_time.to_rfc3339(),
                time_zone: time_zone.to_string(),
            },
            spray_flag: settings.spray_flag,
            user_prompt: settings.user_prompt.clone(),
            alarm_interval: settings.alarm_interval,
            alarm_repeat_times: settings.alarm_repeat_times,
            receivers: settings.receivers.clone(),
        }
    }
}

/// Body of `POST /alarm`: the alarm spec travels as a JSON string.
#[derive(Debug, Serialize)]
pub(crate) struct CreateAlarmRequest {
    pub event: String,
}

impl CreateAlarmRequest {
    pub fn new(spec: &AlarmSpec) -> Result<Self> {
        let event = serde_json::to_string(spec)
            .map_err(|e| Error::Decode(format!("serializing alarm spec: {e}")))?;
        Ok(Self { event })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAlarmResponse {
    #[serde(default)]
    pub message: String,
    pub schedule_name: String,
}

/// Body of `DELETE /alarm`.
#[derive(Debug, Serialize)]
pub(crate) struct DeleteAlarmRequest<'a> {
    pub event_id: &'a str,
    pub schedule_name: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn settings() -> AlarmSettings {
        AlarmSettings::default()
    }

    #[test]
    fn defaults_are_valid() {
        let s = settings();
        assert_eq!(s.alarm_interval, 5);
        assert_eq!(s.alarm_repeat_times, 3);
        assert!(!s.spray_flag);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_unsupported_interval_and_repeat() {
        let s = AlarmSettings {
            alarm_interval: 7,
            ..settings()
        };
        assert!(matches!(s.validate(), Err(Error::InvalidSettings(_))));

        let s = AlarmSettings {
            alarm_repeat_times: 0,
            ..settings()
        };
        assert!(matches!(s.validate(), Err(Error::InvalidSettings(_))));
    }

    #[test]
    fn rejects_bad_or_duplicate_receivers() {
        for bad in ["", "no-at", "a@b", "a b@c.d", "@c.d", "a@@c.d", "a@.d"] {
            let s = AlarmSettings {
                receivers: vec![bad.to_string()],
                ..settings()
            };
            assert!(s.validate().is_err(), "{bad:?} should be rejected");
        }

        let s = AlarmSettings {
            receivers: vec!["a@example.com".into(), "a@example.com".into()],
            ..settings()
        };
        let err = s.validate().unwrap_err().to_string();
        assert!(err.contains("twice"), "got: {err}");
    }

    #[test]
    fn accepts_valid_receivers() {
        let s = AlarmSettings {
            receivers: vec!["a@example.com".into(), "b.c@mail.example.org".into()],
            ..settings()
        };
        assert!(s.validate().is_ok());
    }

    #[test]
    fn create_request_wraps_spec_as_json_string() {
        let start = DateTime::parse_from_rfc3339("2025-03-01T09:00:00+01:00").unwrap();
        let event = CalendarEvent {
            id: "e1".into(),
            title: "Standup".into(),
            start_time: start,
            end_time: start,
            description: String::new(),
        };
        let settings = AlarmSettings {
            spray_flag: true,
            user_prompt: "wake up".into(),
            receivers: vec!["a@example.com".into()],
            ..settings()
        };

        let request = CreateAlarmRequest::new(&AlarmSpec::new(&event, &settings, "Europe/Paris"))
            .unwrap();
        let inner: serde_json::Value = serde_json::from_str(&request.event).unwrap();
        assert_eq!(
            inner,
            serde_json::json!({
                "id": "e1",
                "start": {"dateTime": "2025-03-01T09:00:00+01:00", "timeZone": "Europe/Paris"},
                "spray_flag": true,
                "user_prompt": "wake up",
                "alarm_interval": 5,
                "alarm_repeat_times": 3,
                "receivers": ["a@example.com"]
            })
        );
    }
}
