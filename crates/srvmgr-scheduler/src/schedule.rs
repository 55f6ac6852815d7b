use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::types::{Schedule, ScheduleSpec};

/// sec min hour day-of-month month day-of-week
pub const CRON_FIELDS: usize = 6;

/// Ten years. Longer intervals are almost certainly a unit mistake.
pub const MAX_INTERVAL_SECONDS: i64 = 10 * 365 * 86_400;

/// Parse a six-field cron expression.
///
/// Day-of-week accepts names (`MON-FRI`) or numbers where 1 is Sunday.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    if fields != CRON_FIELDS {
        return Err(SchedulerError::InvalidSchedule(format!(
            "cron expression must have {CRON_FIELDS} fields \
             (second minute hour day month weekday), got {fields}"
        )));
    }
    cron::Schedule::from_str(expression.trim()).map_err(|e| {
        SchedulerError::InvalidSchedule(format!("invalid cron expression {expression:?}: {e}"))
    })
}

/// Turn the submitted scheduling fields into a [`Schedule`].
pub fn parse_schedule(spec: &ScheduleSpec) -> Result<Schedule> {
    let cron = spec
        .cron_expression
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match (cron, spec.interval_seconds) {
        (Some(_), Some(_)) => Err(SchedulerError::InvalidSchedule(
            "cron_expression and interval_seconds are mutually exclusive".into(),
        )),
        (Some(expression), None) => {
            parse_cron(expression)?;
            Ok(Schedule::Cron {
                expression: expression.to_string(),
            })
        }
        (None, Some(seconds)) if seconds <= 0 => Err(SchedulerError::InvalidSchedule(format!(
            "interval_seconds must be positive, got {seconds}"
        ))),
        (None, Some(seconds)) if seconds > MAX_INTERVAL_SECONDS => {
            Err(SchedulerError::InvalidSchedule(format!(
                "interval_seconds must be at most {MAX_INTERVAL_SECONDS}, got {seconds}"
            )))
        }
        (None, Some(seconds)) => Ok(Schedule::Interval {
            seconds: seconds as u64,
        }),
        (None, None) => Ok(Schedule::Manual),
    }
}

/// Re-check an already typed schedule (tasks loaded from storage or built
/// by hand).
pub fn validate_schedule(schedule: &Schedule) -> Result<()> {
    parse_schedule(&ScheduleSpec::from(schedule)).map(|_| ())
}

/// First fire time strictly after `from`, or `None` for manual tasks.
pub fn compute_next_run(schedule: &Schedule, from: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Manual => None,

        Schedule::Interval { seconds } => Some(from + Duration::seconds(*seconds as i64)),

        Schedule::Cron { expression } => match parse_cron(expression) {
            Ok(cron) => cron
                .after(&from.with_timezone(&tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc)),
            Err(e) => {
                warn!(%expression, "stored cron expression no longer parses: {e}");
                None
            }
        },
    }
}

/// Next fire time after a fire that was due at `due` and handled at `now`.
///
/// Intervals keep their phase: the result is `due + k * interval` for the
/// smallest `k` that lands in the future. Fires missed in between are
/// dropped, never queued.
pub fn next_after(
    schedule: &Schedule,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Interval { seconds } => {
            let step_ms = (*seconds as i64).max(1) * 1_000;
            let behind_ms = (now - due).num_milliseconds().max(0);
            let steps = behind_ms / step_ms + 1;
            Some(due + Duration::milliseconds(steps * step_ms))
        }
        _ => compute_next_run(schedule, now.max(due), tz),
    }
}
