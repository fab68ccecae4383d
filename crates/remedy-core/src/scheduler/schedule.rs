use crate::error::{RemedyError, Result};
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Frequency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// Every `interval` minutes.
    Minutes,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    /// Expressions are stored but not evaluated; fires hourly.
    Cron,
}

impl Frequency {
    pub fn all() -> &'static [Frequency] {
        &[
            Frequency::Minutes,
            Frequency::Hourly,
            Frequency::Daily,
            Frequency::Weekly,
            Frequency::Monthly,
            Frequency::Cron,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Minutes => "minutes",
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Cron => "cron",
        }
    }

    /// The first fire time after `from`. `interval` only applies to `minutes`.
    pub fn next_run(self, from: DateTime<Utc>, interval: u32) -> DateTime<Utc> {
        match self {
            Frequency::Minutes => from + Duration::minutes(i64::from(interval.max(1))),
            Frequency::Hourly | Frequency::Cron => from + Duration::hours(1),
            Frequency::Daily => from + Duration::days(1),
            Frequency::Weekly => from + Duration::weeks(1),
            Frequency::Monthly => from
                .checked_add_months(Months::new(1))
                .unwrap_or_else(|| from + Duration::days(30)),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = RemedyError;

    fn from_str(s: &str) -> Result<Self> {
        Frequency::all()
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Frequency::all().iter().map(|f| f.as_str()).collect();
                RemedyError::Validation(format!(
                    "unknown frequency '{s}' (expected one of: {})",
                    valid.join(", ")
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Scheduled,
    Paused,
}

fn default_interval() -> u32 {
    1
}

/// Input for [`super::Scheduler::schedule_automation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub automation_id: String,
    pub frequency: Frequency,
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Overrides the scheduler's default priority.
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub cron: Option<String>,
    /// First fire time; defaults to one period from now.
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
}

impl ScheduleConfig {
    pub fn new(automation_id: impl Into<String>, frequency: Frequency, interval: u32) -> Self {
        Self {
            automation_id: automation_id.into(),
            frequency,
            interval,
            priority: None,
            cron: None,
            start_at: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.automation_id.trim().is_empty() {
            return Err(RemedyError::Validation("schedule has no automation id".into()));
        }
        if self.frequency == Frequency::Minutes && self.interval == 0 {
            return Err(RemedyError::Validation(
                "minutes schedule needs an interval of at least 1".into(),
            ));
        }
        if self.frequency == Frequency::Cron
            && self.cron.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(RemedyError::Validation(
                "cron schedule needs an expression".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub automation_id: String,
    pub frequency: Frequency,
    pub interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    pub status: ScheduleStatus,
    pub next_run: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs: u64,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Scheduled && self.next_run <= now
    }

    /// Record a fire at `now` and move `next_run` one period forward. Missed
    /// periods are skipped rather than replayed.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        let mut next = self.frequency.next_run(self.next_run, self.interval);
        if next <= now {
            next = self.frequency.next_run(now, self.interval);
        }
        self.next_run = next;
        self.last_run = Some(now);
        self.runs += 1;
    }
}

/// Filter for [`super::Scheduler::get_schedules`]; empty matches all.
#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub automation_id: Option<String>,
    pub status: Option<ScheduleStatus>,
}

impl ScheduleFilter {
    pub fn matches(&self, schedule: &Schedule) -> bool {
        self.automation_id
            .as_deref()
            .map_or(true, |id| schedule.automation_id == id)
            && self.status.map_or(true, |s| schedule.status == s)
    }
}
