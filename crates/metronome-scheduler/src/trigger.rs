// Next-occurrence computation for the time-driven schedule kinds
//
// All math happens in the task's IANA zone; results are UTC instants.
// Candidates are enumerated on the naive local timeline and then resolved:
// a fold takes the earlier instant (fires once), a gap advances to its
// first valid exit instant.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use metronome_core::schedule::{parse_cron, parse_once, parse_rrule, resolve_local};
use metronome_core::{ScheduleKind, Task, ValidationError};

/// Outcome of asking "when does this task fire next, strictly after T?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextFire {
    At(DateTime<Utc>),
    /// The recurrence is over (exhausted RRULE, or a once that was emitted).
    Exhausted,
    /// Event-kind tasks have no time-driven fire.
    EventDriven,
}

/// Compute the next occurrence of `task` given the enqueue `watermark`
/// (the greatest `run_at` already emitted, None before the first fire).
///
/// Time-driven kinds only yield occurrences strictly after the watermark,
/// which is also what refuses re-fires under a backward clock jump.
pub fn next_occurrence(
    task: &Task,
    watermark: Option<DateTime<Utc>>,
) -> Result<NextFire, ValidationError> {
    let after = watermark.unwrap_or(task.created_at);
    match task.schedule.kind {
        ScheduleKind::Cron => {
            let tz = task.schedule.tz()?;
            let schedule = parse_cron(&task.schedule.expression)?;
            Ok(match next_cron_fire(&schedule, tz, after) {
                Some(at) => NextFire::At(at),
                None => NextFire::Exhausted,
            })
        }
        ScheduleKind::Rrule => {
            let tz = task.schedule.tz()?;
            let set = parse_rrule(&task.schedule.expression, task.created_at, tz)?;
            // Before the first fire the anchor itself counts (DTSTART is
            // occurrence #1); afterwards nudge past the watermark.
            let lower = match watermark {
                Some(mark) => mark + chrono::Duration::seconds(1),
                None => task.created_at - chrono::Duration::seconds(1),
            }
            .with_timezone(&rrule::Tz::UTC);
            let result = set.after(lower).all(1);
            Ok(match result.dates.first() {
                Some(date) => NextFire::At(date.with_timezone(&Utc)),
                None => NextFire::Exhausted,
            })
        }
        ScheduleKind::Once => {
            let tz = task.schedule.tz()?;
            let at = parse_once(&task.schedule.expression, tz)?;
            // A past timestamp still fires immediately, exactly once: the
            // watermark is what marks it emitted.
            if watermark.map(|mark| at <= mark).unwrap_or(false) {
                Ok(NextFire::Exhausted)
            } else {
                Ok(NextFire::At(at))
            }
        }
        ScheduleKind::Event => Ok(NextFire::EventDriven),
    }
}

/// Walk cron candidates on the naive local timeline and resolve each in the
/// task zone, returning the first resolved instant strictly after `after`.
///
/// Candidates inside a DST gap all resolve to the gap's exit; candidates in
/// a fold resolve to the earlier instant and appear only once on the naive
/// timeline, so a fold fires once.
fn next_cron_fire(
    schedule: &cron::Schedule,
    tz: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let local_after = after.with_timezone(&tz).naive_local();
    // Naive-as-UTC lets the cron crate enumerate wall-clock candidates
    // without applying any zone rules of its own.
    let probe = Utc.from_utc_datetime(&local_after);

    for candidate in schedule.after(&probe) {
        let resolved = resolve_local(candidate.naive_utc(), tz);
        if resolved > after {
            return Some(resolved);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use metronome_core::{
        Pipeline, Schedule, TaskPayload, TaskPolicy, TaskStatus,
    };
    use uuid::Uuid;

    fn task_with(kind: ScheduleKind, expr: &str, tz: &str, created_at: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::now_v7(),
            title: "trigger test".to_string(),
            description: "trigger test".to_string(),
            created_by: "agent-test".to_string(),
            schedule: Schedule::new(kind, expr, tz),
            payload: TaskPayload {
                pipeline: Pipeline { steps: vec![] },
                params: serde_json::Map::new(),
            },
            policy: TaskPolicy::default(),
            status: TaskStatus::Active,
            catch_up: Default::default(),
            next_run: None,
            last_enqueued_at: None,
            snoozed_until: None,
            created_at,
            updated_at: created_at,
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn daily_cron_in_utc() {
        let task = task_with(ScheduleKind::Cron, "30 9 * * *", "UTC", utc(2024, 6, 1, 0, 0, 0));
        let next = next_occurrence(&task, Some(utc(2024, 6, 1, 10, 0, 0))).unwrap();
        assert_eq!(next, NextFire::At(utc(2024, 6, 2, 9, 30, 0)));
    }

    #[test]
    fn cron_respects_task_timezone() {
        // 09:30 in Chicago (CDT, UTC-5) is 14:30 UTC
        let task = task_with(
            ScheduleKind::Cron,
            "30 9 * * *",
            "America/Chicago",
            utc(2024, 6, 1, 0, 0, 0),
        );
        let next = next_occurrence(&task, Some(utc(2024, 6, 1, 0, 0, 0))).unwrap();
        assert_eq!(next, NextFire::At(utc(2024, 6, 1, 14, 30, 0)));
    }

    #[test]
    fn spring_forward_gap_shifts_to_exit() {
        // 02:30 America/New_York does not exist on 2024-03-10; the fire
        // lands at the gap exit, 03:00 EDT = 07:00 UTC.
        let task = task_with(
            ScheduleKind::Cron,
            "30 2 * * *",
            "America/New_York",
            utc(2024, 3, 9, 0, 0, 0),
        );
        let next = next_occurrence(&task, Some(utc(2024, 3, 10, 6, 0, 0))).unwrap();
        assert_eq!(next, NextFire::At(utc(2024, 3, 10, 7, 0, 0)));

        // The next day's 02:30 EDT (06:30 UTC on the 11th) is unaffected.
        let following = next_occurrence(&task, Some(utc(2024, 3, 10, 7, 0, 0))).unwrap();
        assert_eq!(following, NextFire::At(utc(2024, 3, 11, 6, 30, 0)));
    }

    #[test]
    fn fall_back_fold_fires_once_at_earlier_instant() {
        // 01:30 America/New_York happens twice on 2024-11-03. The earlier
        // (EDT) instant is 05:30 UTC; the later (EST) 06:30 UTC must not
        // produce a second occurrence.
        let task = task_with(
            ScheduleKind::Cron,
            "30 1 * * *",
            "America/New_York",
            utc(2024, 11, 2, 0, 0, 0),
        );
        let next = next_occurrence(&task, Some(utc(2024, 11, 3, 4, 0, 0))).unwrap();
        assert_eq!(next, NextFire::At(utc(2024, 11, 3, 5, 30, 0)));

        // Asking after the earlier instant jumps to the next day, not the
        // repeated local time.
        let following = next_occurrence(&task, Some(utc(2024, 11, 3, 5, 30, 0))).unwrap();
        assert_eq!(following, NextFire::At(utc(2024, 11, 4, 6, 30, 0)));
    }

    #[test]
    fn rrule_count_exhausts() {
        let created = utc(2024, 6, 1, 9, 0, 0);
        let task = task_with(ScheduleKind::Rrule, "FREQ=DAILY;COUNT=2", "UTC", created);

        // Occurrences: the anchor itself plus one more day.
        let first = next_occurrence(&task, None).unwrap();
        assert_eq!(first, NextFire::At(utc(2024, 6, 1, 9, 0, 0)));
        let second = next_occurrence(&task, Some(utc(2024, 6, 1, 9, 0, 0))).unwrap();
        assert_eq!(second, NextFire::At(utc(2024, 6, 2, 9, 0, 0)));
        let done = next_occurrence(&task, Some(utc(2024, 6, 2, 9, 0, 0))).unwrap();
        assert_eq!(done, NextFire::Exhausted);
    }

    #[test]
    fn once_in_the_past_still_fires_then_exhausts() {
        let task = task_with(
            ScheduleKind::Once,
            "2024-01-01T00:00:00Z",
            "UTC",
            utc(2024, 6, 1, 0, 0, 0),
        );
        let next = next_occurrence(&task, None).unwrap();
        assert_eq!(next, NextFire::At(utc(2024, 1, 1, 0, 0, 0)));

        // Once the watermark covers the timestamp it never fires again.
        let done = next_occurrence(&task, Some(utc(2024, 1, 1, 0, 0, 0))).unwrap();
        assert_eq!(done, NextFire::Exhausted);
    }

    #[test]
    fn event_tasks_have_no_timed_fire() {
        let task = task_with(
            ScheduleKind::Event,
            "orders.created",
            "UTC",
            utc(2024, 6, 1, 0, 0, 0),
        );
        assert_eq!(
            next_occurrence(&task, Some(utc(2024, 6, 1, 0, 0, 0))).unwrap(),
            NextFire::EventDriven
        );
    }

    #[test]
    fn backward_clock_guard_is_just_the_watermark() {
        // With the watermark at the last emitted occurrence, a "now" far in
        // the past cannot produce anything at or before the watermark.
        let task = task_with(ScheduleKind::Cron, "0 * * * *", "UTC", utc(2024, 6, 1, 0, 0, 0));
        let watermark = utc(2024, 6, 2, 10, 0, 0);
        let next = next_occurrence(&task, Some(watermark)).unwrap();
        assert_eq!(next, NextFire::At(utc(2024, 6, 2, 11, 0, 0)));
    }
}
