// Scheduler: the singleton time source
//
// Expands cron/RRULE/once schedules into due-work rows and matches events
// against event-kind tasks. The task table is the source of truth; the
// in-memory trigger set is a cache rebuilt at startup and refreshed by the
// change feed.

pub mod events;
pub mod scheduler;
pub mod trigger;

pub use events::EventDedupe;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use trigger::{next_occurrence, NextFire};
