//! Scheduled job model and timezone-aware cron evaluation.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;

/// A recurring instruction: fire the agent with a fixed prompt on a cron
/// schedule and deliver the answer to a channel.
///
/// Owned by external persistence; the kernel holds only transient timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Prompt submitted to the agent on every run.
    pub prompt: String,
    /// Five-field cron expression.
    pub cron: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    /// Delivery platform tag.
    pub platform: String,
    /// Delivery target channel.
    pub channel_id: String,
    pub enabled: bool,

    // Runtime state (store-managed)
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    /// Create a new enabled job with no run history.
    pub fn new(
        name: impl Into<String>,
        prompt: impl Into<String>,
        cron: impl Into<String>,
        timezone: impl Into<String>,
        platform: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            prompt: prompt.into(),
            cron: cron.into(),
            timezone: timezone.into(),
            platform: platform.into(),
            channel_id: channel_id.into(),
            enabled: true,
            last_run_at: None,
            last_run_status: None,
            last_run_error: None,
            next_run_at: None,
        }
    }
}

/// Status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Normalize a standard five-field cron expression to the seven-field form
/// the `cron` crate parses (seconds prepended, year appended).
fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed} *"),
        6 => format!("{trimmed} *"),
        _ => trimmed.to_string(),
    }
}

/// Parse a cron expression, accepting the standard five-field form.
pub fn parse_cron(expr: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(&normalize_cron(expr)).map_err(|e| ScheduleError::Cron {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

/// Validate a cron expression without scheduling anything. Used by the
/// management surface before accepting a job.
pub fn validate_cron(expr: &str) -> Result<(), ScheduleError> {
    parse_cron(expr).map(|_| ())
}

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::Timezone(name.to_string()))
}

/// Compute the next strictly-future fire instant for a cron expression
/// evaluated in a timezone.
///
/// If the literal next occurrence is not in the future relative to `now`,
/// the occurrence after it is used instead — a missed slot never fires
/// immediately.
pub fn next_fire(expr: &str, timezone: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let schedule = parse_cron(expr)?;
    let tz = parse_timezone(timezone)?;

    let exhausted = || ScheduleError::Cron {
        expr: expr.to_string(),
        message: "no upcoming occurrence".to_string(),
    };

    let mut upcoming = schedule.after(&now.with_timezone(&tz));
    let mut fire = upcoming.next().ok_or_else(exhausted)?;
    if fire.with_timezone(&Utc) <= now {
        fire = upcoming.next().ok_or_else(exhausted)?;
    }
    Ok(fire.with_timezone(&Utc))
}
