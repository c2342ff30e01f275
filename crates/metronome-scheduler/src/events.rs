// Event-id dedupe for at-least-once bus delivery

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Rolling window of event ids already handed to the scheduler. The event
/// table's primary key is the durable dedupe; this window additionally
/// covers direct `on_event` calls and re-deliveries racing the table prune.
pub struct EventDedupe {
    seen: HashMap<String, DateTime<Utc>>,
    window: chrono::Duration,
}

impl EventDedupe {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::minutes(5)),
        }
    }

    /// True exactly once per id within the window.
    pub fn first_seen(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.window;
        self.seen.retain(|_, at| *at >= cutoff);

        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_within_window_are_rejected() {
        let mut dedupe = EventDedupe::new(Duration::from_secs(300));
        let now = Utc::now();
        assert!(dedupe.first_seen("evt-1", now));
        assert!(!dedupe.first_seen("evt-1", now + chrono::Duration::seconds(10)));
        assert!(dedupe.first_seen("evt-2", now));
    }

    #[test]
    fn ids_age_out_of_the_window() {
        let mut dedupe = EventDedupe::new(Duration::from_secs(60));
        let now = Utc::now();
        assert!(dedupe.first_seen("evt-1", now));
        // Past the window, the id is forgotten and counts as new again.
        assert!(dedupe.first_seen("evt-1", now + chrono::Duration::seconds(120)));
        assert_eq!(dedupe.len(), 1);
    }
}
