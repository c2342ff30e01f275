// Run context: the {params, steps, now} mapping a pipeline evolves

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Per-run template context with three reserved namespaces:
/// `params` (task params merged with per-run overrides), `steps` (outputs
/// keyed by step name, in execution order) and `now` (the run's start
/// instant, constant for the whole run).
#[derive(Debug, Clone)]
pub struct RunContext {
    root: Value,
    now: DateTime<Utc>,
}

impl RunContext {
    pub fn new(params: &Map<String, Value>, overrides: &Map<String, Value>, now: DateTime<Utc>) -> Self {
        let mut merged = params.clone();
        for (k, v) in overrides {
            merged.insert(k.clone(), v.clone());
        }

        let mut root = Map::new();
        root.insert("params".to_string(), Value::Object(merged));
        root.insert("steps".to_string(), Value::Object(Map::new()));
        root.insert("now".to_string(), Value::String(format_instant(now)));

        Self {
            root: Value::Object(root),
            now,
        }
    }

    /// The run's start instant.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The whole context as a JSON value, for expression evaluation.
    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Record a step's output under its name. Insertion order is
    /// preserved, so the final map follows declaration order.
    pub fn record_step(&mut self, name: &str, output: Value) {
        if let Some(Value::Object(steps)) = self.root.get_mut("steps") {
            steps.insert(name.to_string(), output);
        }
    }

    /// The accumulated steps map.
    pub fn steps(&self) -> &Map<String, Value> {
        match self.root.get("steps") {
            Some(Value::Object(steps)) => steps,
            _ => unreachable!("steps namespace always present"),
        }
    }

    /// Consume the context, returning the steps map.
    pub fn into_steps(mut self) -> Map<String, Value> {
        match self.root.get_mut("steps").map(Value::take) {
            Some(Value::Object(steps)) => steps,
            _ => Map::new(),
        }
    }
}

/// ISO-8601 instant format used everywhere templates surface times.
pub fn format_instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
