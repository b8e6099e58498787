//! Working-hours scheduling.
//!
//! Maps a candidate execution instant onto the automation's configured
//! working windows. All window math happens in the automation's own IANA
//! zone; only the final instant is converted back to UTC.

use chrono::{DateTime, Datelike, Days, TimeZone, Utc};
use chrono_tz::Tz;
use taskpilot_core::{Result, TaskPilotError};

use crate::definitions::ScheduleConfig;

/// How many days ahead the scan looks for a usable working window.
const SCAN_DAYS: u64 = 14;

/// Resolve the actual execution instant for `candidate` under an optional
/// working-hours schedule.
///
/// No schedule, or a disabled one, passes the candidate through. Otherwise
/// the candidate is viewed in the schedule's zone and the next usable window
/// within 14 days is picked: the candidate itself if it already falls inside
/// that day's window, the day's start if the window opens later, else the
/// first following working day's start. Days listed as non-working, days
/// without a valid window, and days whose start falls into a DST gap are
/// skipped. If no day qualifies the candidate is returned unchanged rather
/// than deferring work indefinitely.
pub fn next_execution(
    candidate: DateTime<Utc>,
    schedule: Option<&ScheduleConfig>,
) -> Result<DateTime<Utc>> {
    let Some(cfg) = schedule else {
        return Ok(candidate);
    };
    if !cfg.enabled {
        return Ok(candidate);
    }

    let tz: Tz = cfg
        .timezone
        .parse()
        .map_err(|_| TaskPilotError::Config(format!("Unknown timezone '{}'", cfg.timezone)))?;

    let local = candidate.with_timezone(&tz);
    let local_date = local.date_naive();
    let local_time = local.time();

    for offset in 0..SCAN_DAYS {
        let Some(day) = local_date.checked_add_days(Days::new(offset)) else {
            break;
        };
        if cfg.non_working_dates.contains(&day) {
            continue;
        }
        let window = cfg.week.day(day.weekday());
        if !window.enabled {
            continue;
        }
        let Some((start, end)) = window.window() else {
            continue;
        };

        if offset == 0 {
            if local_time >= start && local_time < end {
                return Ok(candidate);
            }
            if local_time >= end {
                // Today's window already closed; keep scanning.
                continue;
            }
        }

        // Earliest resolution on DST ambiguity; a start swallowed by a DST
        // gap makes the day unusable.
        if let Some(at) = tz.from_local_datetime(&day.and_time(start)).earliest() {
            return Ok(at.with_timezone(&Utc));
        }
    }

    tracing::warn!(
        "⏰ No working window within {SCAN_DAYS} days of {candidate}; executing at candidate time"
    );
    Ok(candidate)
}

/// Human-readable rendering of an instant in the schedule's zone (UTC when
/// no schedule applies). Stored alongside the UTC instant for the monitor.
pub fn zoned_display(at: DateTime<Utc>, schedule: Option<&ScheduleConfig>) -> String {
    let tz: Option<Tz> = schedule.and_then(|s| s.timezone.parse().ok());
    match tz {
        Some(tz) => at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string(),
        None => at.format("%Y-%m-%d %H:%M UTC").to_string(),
    }
}
