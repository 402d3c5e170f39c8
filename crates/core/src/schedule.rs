//! Recurring schedule specs and next-occurrence computation.
//!
//! All arithmetic is wall-clock in the schedule's IANA timezone, not UTC
//! offset addition. DST rules: a local time that does not exist (spring
//! forward) shifts forward past the gap, so a daily 02:30 schedule fires
//! at 03:30 on the skip day; an ambiguous local time (fall back) takes
//! the earlier offset.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::JobKind;
use crate::types::{EntityId, ScheduleId, Timestamp};

// ---------------------------------------------------------------------------
// Time of day
// ---------------------------------------------------------------------------

/// Wall-clock time of day, `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl Default for TimeOfDay {
    /// 09:00, the default delivery time for reports.
    fn default() -> Self {
        Self { hour: 9, minute: 0 }
    }
}

impl FromStr for TimeOfDay {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| CoreError::Validation(format!("invalid time of day '{s}', expected HH:MM")))?;
        let hour: u32 = h
            .parse()
            .map_err(|_| CoreError::Validation(format!("invalid hour '{h}'")))?;
        let minute: u32 = m
            .parse()
            .map_err(|_| CoreError::Validation(format!("invalid minute '{m}'")))?;
        if hour > 23 || minute > 59 {
            return Err(CoreError::Validation(format!(
                "time of day '{s}' out of range"
            )));
        }
        Ok(Self { hour, minute })
    }
}

// ---------------------------------------------------------------------------
// Grain
// ---------------------------------------------------------------------------

/// Recurrence shape of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "grain", rename_all = "snake_case")]
pub enum ScheduleGrain {
    Daily {
        time_of_day: TimeOfDay,
    },
    Weekly {
        weekday: Weekday,
        time_of_day: TimeOfDay,
    },
    Monthly {
        /// 1-based day of month, clamped to the month's length
        /// (31 fires on Feb 28/29).
        day: u32,
        time_of_day: TimeOfDay,
    },
    Cron {
        /// 5-field (`min hour dom mon dow`) or 6-field (with leading
        /// seconds) cron expression.
        expr: String,
    },
}

// ---------------------------------------------------------------------------
// ScheduleSpec
// ---------------------------------------------------------------------------

/// A recurring rule that materializes jobs on a cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub schedule_id: ScheduleId,
    pub grain: ScheduleGrain,
    pub timezone: Tz,
    /// Job kind to materialize at each fire.
    pub kind: JobKind,
    /// Entity the materialized job points at.
    pub entity_id: EntityId,
    pub priority: i32,
    pub active: bool,
    pub next_run_at: Option<Timestamp>,
    pub last_run_at: Option<Timestamp>,
}

impl ScheduleSpec {
    pub fn new(grain: ScheduleGrain, timezone: Tz, kind: JobKind, entity_id: EntityId) -> Self {
        Self {
            schedule_id: uuid::Uuid::now_v7(),
            grain,
            timezone,
            kind,
            entity_id,
            priority: crate::job::PRIORITY_NORMAL,
            active: true,
            next_run_at: None,
            last_run_at: None,
        }
    }

    /// Compute the next occurrence strictly after `after`.
    pub fn next_occurrence(&self, after: Timestamp) -> Result<Timestamp, CoreError> {
        let local_after = after.with_timezone(&self.timezone);
        match &self.grain {
            ScheduleGrain::Daily { time_of_day } => {
                let mut date = local_after.date_naive();
                for _ in 0..3 {
                    let candidate = resolve_local(date, *time_of_day, self.timezone);
                    if candidate > after {
                        return Ok(candidate.with_timezone(&Utc));
                    }
                    date = date.succ_opt().ok_or_else(date_overflow)?;
                }
                Err(CoreError::Internal("daily schedule did not converge".into()))
            }
            ScheduleGrain::Weekly {
                weekday,
                time_of_day,
            } => {
                let mut date = local_after.date_naive();
                // At most 8 iterations: today may match but be in the past.
                for _ in 0..9 {
                    if date.weekday() == *weekday {
                        let candidate = resolve_local(date, *time_of_day, self.timezone);
                        if candidate > after {
                            return Ok(candidate.with_timezone(&Utc));
                        }
                    }
                    date = date.succ_opt().ok_or_else(date_overflow)?;
                }
                Err(CoreError::Internal("weekly schedule did not converge".into()))
            }
            ScheduleGrain::Monthly { day, time_of_day } => {
                if *day == 0 || *day > 31 {
                    return Err(CoreError::Validation(format!(
                        "day of month {day} out of range"
                    )));
                }
                let (mut year, mut month) = (local_after.year(), local_after.month());
                for _ in 0..3 {
                    let clamped = (*day).min(days_in_month(year, month));
                    let date = NaiveDate::from_ymd_opt(year, month, clamped)
                        .ok_or_else(date_overflow)?;
                    let candidate = resolve_local(date, *time_of_day, self.timezone);
                    if candidate > after {
                        return Ok(candidate.with_timezone(&Utc));
                    }
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                }
                Err(CoreError::Internal("monthly schedule did not converge".into()))
            }
            ScheduleGrain::Cron { expr } => {
                let schedule = parse_cron(expr)?;
                schedule
                    .after(&local_after)
                    .next()
                    .map(|t| t.with_timezone(&Utc))
                    .ok_or_else(|| {
                        CoreError::Validation(format!("cron '{expr}' has no future occurrence"))
                    })
            }
        }
    }
}

fn date_overflow() -> CoreError {
    CoreError::Internal("date arithmetic overflow".into())
}

/// Resolve a wall-clock instant in `tz`, applying the DST rules.
fn resolve_local(date: NaiveDate, tod: TimeOfDay, tz: Tz) -> DateTime<Tz> {
    let mut naive = date
        .and_hms_opt(tod.hour, tod.minute, 0)
        .expect("TimeOfDay is range-checked");
    loop {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => return t,
            // Fall back: two valid instants, take the earlier offset.
            LocalResult::Ambiguous(earlier, _later) => return earlier,
            // Spring forward: the wall-clock time does not exist; step
            // past the gap in 30-minute increments.
            LocalResult::None => naive += Duration::minutes(30),
        }
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_y, next_m) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_y, next_m, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Parse a cron expression, accepting the common 5-field form by
/// prefixing a seconds field.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, CoreError> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| CoreError::Validation(format!("invalid cron expression '{expr}': {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
