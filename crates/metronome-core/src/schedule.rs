// Schedule kinds and expression validation
//
// Expressions are validated at the API boundary; the scheduler re-parses
// them when computing occurrences. Both paths share the helpers here so the
// two can never disagree on what is a valid expression.

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ValidationError;

/// Discriminant of the schedule union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Rrule,
    Once,
    Event,
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleKind::Cron => "cron",
            ScheduleKind::Rrule => "rrule",
            ScheduleKind::Once => "once",
            ScheduleKind::Event => "event",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleKind::Cron),
            "rrule" => Ok(ScheduleKind::Rrule),
            "once" => Ok(ScheduleKind::Once),
            "event" => Ok(ScheduleKind::Event),
            other => Err(format!("unknown schedule kind: {}", other)),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// A task's trigger: a cron expression, an RFC-5545 RRULE body, a one-shot
/// timestamp, or an event topic. The timezone applies to the time-driven
/// kinds and is ignored for `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub kind: ScheduleKind,
    pub expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Schedule {
    pub fn new(kind: ScheduleKind, expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            kind,
            expression: expression.into(),
            timezone: timezone.into(),
        }
    }

    /// Parse the IANA timezone name.
    pub fn tz(&self) -> Result<Tz, ValidationError> {
        self.timezone.parse::<Tz>().map_err(|_| {
            ValidationError::new("timezone", &self.timezone, "an IANA timezone name")
        })
    }

    /// Validate the expression against its kind. `anchor` is the instant an
    /// RRULE would be anchored at (task creation time).
    pub fn validate(&self, anchor: DateTime<Utc>) -> Result<(), ValidationError> {
        let tz = self.tz()?;
        match self.kind {
            ScheduleKind::Cron => {
                parse_cron(&self.expression)?;
            }
            ScheduleKind::Rrule => {
                parse_rrule(&self.expression, anchor, tz)?;
            }
            ScheduleKind::Once => {
                parse_once(&self.expression, tz)?;
            }
            ScheduleKind::Event => {
                if self.expression.trim().is_empty() {
                    return Err(ValidationError::new(
                        "schedule_expr",
                        &self.expression,
                        "a non-empty event topic",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Parse a 5-field cron expression.
///
/// The cron crate wants a seconds column first; callers supply the standard
/// 5-field form and we pin seconds to zero.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, ValidationError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ValidationError::new(
            "schedule_expr",
            expression,
            "a 5-field cron expression",
        ));
    }
    let normalized = format!("0 {}", fields.join(" "));
    cron::Schedule::from_str(&normalized).map_err(|e| {
        ValidationError::new(
            "schedule_expr",
            expression,
            format!("a valid cron expression ({})", e),
        )
    })
}

/// Parse an RRULE body anchored at `anchor` in `tz`.
///
/// Accepts a bare body (`FREQ=DAILY;COUNT=3`) or one already carrying the
/// `RRULE:` prefix.
pub fn parse_rrule(
    expression: &str,
    anchor: DateTime<Utc>,
    tz: Tz,
) -> Result<rrule::RRuleSet, ValidationError> {
    let body = expression.strip_prefix("RRULE:").unwrap_or(expression);
    let local = anchor.with_timezone(&tz);
    let dtstart = if tz == chrono_tz::UTC {
        format!("DTSTART:{}", local.format("%Y%m%dT%H%M%SZ"))
    } else {
        format!("DTSTART;TZID={}:{}", tz.name(), local.format("%Y%m%dT%H%M%S"))
    };
    let full = format!("{}\nRRULE:{}", dtstart, body);
    full.parse::<rrule::RRuleSet>().map_err(|e| {
        ValidationError::new(
            "schedule_expr",
            expression,
            format!("a valid RFC-5545 RRULE body ({})", e),
        )
    })
}

/// Parse a one-shot timestamp. RFC-3339 is taken as-is; a naive
/// `YYYY-MM-DDTHH:MM:SS` is interpreted in the task's timezone.
pub fn parse_once(expression: &str, tz: Tz) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(expression) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(expression, "%Y-%m-%dT%H:%M:%S").map_err(|_| {
        ValidationError::new(
            "schedule_expr",
            expression,
            "an ISO-8601 timestamp",
        )
    })?;
    Ok(resolve_local(naive, tz))
}

/// Resolve a naive local time to a UTC instant under the DST contract:
/// ambiguous (fold) times take the earlier instant; non-existent (gap)
/// times advance to the first valid instant after the gap.
pub fn resolve_local(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earlier, _later) => earlier.with_timezone(&Utc),
        LocalResult::None => {
            // Walk forward minute by minute to the gap's exit. DST gaps are
            // at most a few hours; bail to UTC interpretation if the zone
            // data is stranger than that.
            let mut probe = naive;
            for _ in 0..(48 * 60) {
                probe += chrono::Duration::minutes(1);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(dt) => return dt.with_timezone(&Utc),
                    LocalResult::Ambiguous(earlier, _) => return earlier.with_timezone(&Utc),
                    LocalResult::None => continue,
                }
            }
            Utc.from_utc_datetime(&naive)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn accepts_five_field_cron() {
        assert!(parse_cron("30 2 * * *").is_ok());
        assert!(parse_cron("*/5 * * * 1-5").is_ok());
    }

    #[test]
    fn rejects_six_field_cron() {
        assert!(parse_cron("0 30 2 * * *").is_err());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn validates_rrule_body() {
        let sched = Schedule::new(ScheduleKind::Rrule, "FREQ=DAILY;COUNT=3", "America/New_York");
        assert!(sched.validate(anchor()).is_ok());

        let bad = Schedule::new(ScheduleKind::Rrule, "FREQ=SOMETIMES", "UTC");
        assert!(bad.validate(anchor()).is_err());
    }

    #[test]
    fn rrule_prefix_is_tolerated() {
        let sched = Schedule::new(ScheduleKind::Rrule, "RRULE:FREQ=WEEKLY", "UTC");
        assert!(sched.validate(anchor()).is_ok());
    }

    #[test]
    fn once_accepts_rfc3339_and_naive() {
        let tz: Tz = "America/Chicago".parse().unwrap();
        let utc = parse_once("2024-06-01T12:00:00Z", tz).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());

        // Naive timestamps resolve in the task zone (CDT = UTC-5 in June)
        let local = parse_once("2024-06-01T12:00:00", tz).unwrap();
        assert_eq!(local, Utc.with_ymd_and_hms(2024, 6, 1, 17, 0, 0).unwrap());
    }

    #[test]
    fn rejects_unknown_timezone() {
        let sched = Schedule::new(ScheduleKind::Cron, "0 9 * * *", "Mars/Olympus");
        assert!(sched.validate(anchor()).is_err());
    }

    #[test]
    fn event_requires_topic() {
        let empty = Schedule::new(ScheduleKind::Event, "  ", "UTC");
        assert!(empty.validate(anchor()).is_err());
        let ok = Schedule::new(ScheduleKind::Event, "orders.created", "UTC");
        assert!(ok.validate(anchor()).is_ok());
    }

    #[test]
    fn gap_time_resolves_to_first_instant_after() {
        // 2024-03-10 02:30 does not exist in America/New_York; the gap
        // exits at 03:00 EDT = 07:00 UTC.
        let tz: Tz = "America/New_York".parse().unwrap();
        let naive = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(2, 30, 0)
            .unwrap();
        let resolved = resolve_local(naive, tz);
        assert_eq!(resolved, Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap());
    }

    #[test]
    fn fold_time_resolves_to_earlier_instant() {
        // 2024-11-03 01:30 happens twice in America/New_York; the earlier
        // (EDT, UTC-4) instant wins: 05:30 UTC.
        let tz: Tz = "America/New_York".parse().unwrap();
        let naive = NaiveDate::from_ymd_opt(2024, 11, 3)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        let resolved = resolve_local(naive, tz);
        assert_eq!(resolved, Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap());
    }
}
