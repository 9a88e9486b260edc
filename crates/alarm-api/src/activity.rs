//! Alarm trigger history: filtering, statistics and CSV export

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Days of history shown when no range is given.
pub const DEFAULT_HISTORY_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Success,
    InProgress,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Success => "success",
            ActivityStatus::InProgress => "in_progress",
            ActivityStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    PressureMat,
    Infrared,
    Camera,
    Microphone,
}

/// Raw sensor value; mats and infrared report booleans, microphones levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SensorType,
    pub value: SensorValue,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemedialActionType {
    WaterSpray,
    Slapping,
    EmailNotification,
    SmsNotification,
}

impl RemedialActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemedialActionType::WaterSpray => "water_spray",
            RemedialActionType::Slapping => "slapping",
            RemedialActionType::EmailNotification => "email_notification",
            RemedialActionType::SmsNotification => "sms_notification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub relationship: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemedialAction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RemedialActionType,
    pub trigger_time: DateTime<Utc>,
    pub executed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_contact: Option<Contact>,
}

/// One alarm trigger and what happened after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmActivity {
    pub id: String,
    pub event_id: String,
    pub event_title: String,
    pub trigger_time: DateTime<Utc>,
    pub status: ActivityStatus,
    #[serde(default)]
    pub sensor_data: Vec<SensorReading>,
    #[serde(default)]
    pub remedial_actions: Vec<RemedialAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_up_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl AlarmActivity {
    /// Minutes from trigger to wake-up, if the user woke up.
    pub fn wake_up_minutes(&self) -> Option<f64> {
        self.wake_up_time
            .map(|woke| (woke - self.trigger_time).num_seconds() as f64 / 60.0)
    }
}

/// Body of `GET /activity`.
#[derive(Debug, Deserialize)]
pub(crate) struct ActivitiesResponse {
    #[serde(default)]
    pub activities: Vec<AlarmActivity>,
}

/// Inclusive trigger-time range plus an optional status.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityFilter {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: Option<ActivityStatus>,
}

impl ActivityFilter {
    /// The last `DEFAULT_HISTORY_DAYS` days up to `now`, any status.
    pub fn recent(now: DateTime<Utc>) -> Self {
        Self {
            start: now - Duration::days(DEFAULT_HISTORY_DAYS),
            end: now,
            status: None,
        }
    }

    /// Build a filter from date-only bounds. `start` counts from the start of
    /// its day and `end` to the end of its day; a missing bound falls back to
    /// the default range.
    pub fn from_dates(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        status: Option<ActivityStatus>,
        now: DateTime<Utc>,
    ) -> Self {
        let default = Self::recent(now);
        let start = start
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc())
            .unwrap_or(default.start);
        let end = end
            .and_then(|d| d.and_hms_milli_opt(23, 59, 59, 999))
            .map(|t| t.and_utc())
            .unwrap_or(default.end);
        Self { start, end, status }
    }

    pub fn matches(&self, activity: &AlarmActivity) -> bool {
        activity.trigger_time >= self.start
            && activity.trigger_time <= self.end
            && self.status.is_none_or(|s| s == activity.status)
    }

    /// Activities passing the filter, newest first.
    pub fn apply<'a>(&self, activities: &'a [AlarmActivity]) -> Vec<&'a AlarmActivity> {
        let mut hits: Vec<&AlarmActivity> =
            activities.iter().filter(|a| self.matches(a)).collect();
        hits.sort_by(|a, b| b.trigger_time.cmp(&a.trigger_time));
        hits
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStatistics {
    pub total_triggers: usize,
    /// Fraction of triggers with status `success`, 0 when there are none
    pub success_rate: f64,
    /// Mean trigger-to-wake-up time over activities that have one
    pub average_wake_up_minutes: f64,
    pub remedial_actions_triggered: usize,
}

impl ActivityStatistics {
    pub fn compute<'a, I>(activities: I) -> Self
    where
        I: IntoIterator<Item = &'a AlarmActivity>,
    {
        let mut stats = Self::default();
        let mut successes = 0usize;
        let mut wake_total = 0.0;
        let mut wake_count = 0usize;

        for activity in activities {
            stats.total_triggers += 1;
            if activity.status == ActivityStatus::Success {
                successes += 1;
            }
            if let Some(minutes) = activity.wake_up_minutes() {
                wake_total += minutes;
                wake_count += 1;
            }
            stats.remedial_actions_triggered += activity.remedial_actions.len();
        }

        if stats.total_triggers > 0 {
            stats.success_rate = successes as f64 / stats.total_triggers as f64;
        }
        if wake_count > 0 {
            stats.average_wake_up_minutes = wake_total / wake_count as f64;
        }
        stats
    }
}

const CSV_HEADER: [&str; 5] = ["Date", "Event", "Status", "Wake Up Time", "Remedial Actions"];

/// Render activities as CSV, one row per activity after the header.
pub fn to_csv<'a, I>(activities: I) -> String
where
    I: IntoIterator<Item = &'a AlarmActivity>,
{
    let mut out = String::new();
    write_row(&mut out, CSV_HEADER.iter().map(|s| s.to_string()));
    for activity in activities {
        let actions = activity
            .remedial_actions
            .iter()
            .map(|a| a.kind.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        write_row(
            &mut out,
            [
                activity.trigger_time.format("%Y-%m-%d").to_string(),
                activity.event_title.clone(),
                activity.status.as_str().to_string(),
                activity
                    .wake_up_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                actions,
            ],
        );
    }
    out
}

fn write_row(out: &mut String, fields: impl IntoIterator<Item = String>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&csv_field(&field));
    }
    out.push('\n');
}

/// Quote a field when it holds a separator, a quote or a line break.
fn csv_field(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\"")).into()
    } else {
        field.into()
    }
}

/// Download name for an export made on `date`.
pub fn export_file_name(date: NaiveDate) -> String {
    format!("alarm-activity-{}.csv", date.format("%Y-%m-%d"))
}
