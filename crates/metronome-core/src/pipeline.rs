// Pipeline and step declarations
//
// A pipeline is the declarative part of a task's payload: an ordered list
// of steps, each naming a tool address and a template-bearing argument map.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::policy::BackoffStrategy;

/// Ordered sequence of steps inside a task's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline {
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Step ids (and `save_as` aliases) must be unique so each step has its
    /// own slot in the output context.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(ValidationError::new(
                    "payload.pipeline",
                    &step.id,
                    "a non-empty step id",
                ));
            }
            let slot = step.output_name();
            if !seen.insert(slot.to_string()) {
                return Err(ValidationError::new(
                    "payload.pipeline",
                    slot,
                    "unique step ids and save_as names",
                ));
            }
        }
        Ok(())
    }
}

/// One unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the pipeline.
    pub id: String,

    /// Tool address resolved through the registry (e.g. "http.fetch").
    pub uses: String,

    /// Argument name -> template or literal.
    #[serde(default)]
    pub with: serde_json::Map<String, Value>,

    /// Name under which the step's output lands in the context; defaults
    /// to the step id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,

    /// Boolean template/JMESPath; a falsy result skips the step.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Per-step timeout in seconds; falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Step-local retry policy overriding the task-level policy for this
    /// step only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<StepRetryPolicy>,
}

impl Step {
    pub fn output_name(&self) -> &str {
        self.save_as.as_deref().unwrap_or(&self.id)
    }
}

/// Retry policy local to one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRetryPolicy {
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_strategy: Option<BackoffStrategy>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline(v: Value) -> Pipeline {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn parses_minimal_step() {
        let p = pipeline(json!([{"id": "a", "uses": "echo", "with": {"message": "hi"}}]));
        assert_eq!(p.steps.len(), 1);
        assert_eq!(p.steps[0].output_name(), "a");
        assert!(p.validate().is_ok());
    }

    #[test]
    fn save_as_overrides_output_name() {
        let p = pipeline(json!([
            {"id": "fetch", "uses": "http.fetch", "with": {}, "save_as": "page"}
        ]));
        assert_eq!(p.steps[0].output_name(), "page");
    }

    #[test]
    fn rejects_duplicate_output_names() {
        let p = pipeline(json!([
            {"id": "a", "uses": "echo"},
            {"id": "b", "uses": "echo", "save_as": "a"}
        ]));
        assert!(p.validate().is_err());
    }

    #[test]
    fn if_field_round_trips() {
        let p = pipeline(json!([
            {"id": "a", "uses": "echo", "if": "params.enabled"}
        ]));
        assert_eq!(p.steps[0].condition.as_deref(), Some("params.enabled"));
        let back = serde_json::to_value(&p).unwrap();
        assert_eq!(back[0]["if"], json!("params.enabled"));
    }

    #[test]
    fn step_retries_parse() {
        let p = pipeline(json!([
            {"id": "a", "uses": "flaky", "retries": {"max_retries": 2, "backoff_strategy": "fixed"}}
        ]));
        let retries = p.steps[0].retries.as_ref().unwrap();
        assert_eq!(retries.max_retries, 2);
        assert_eq!(retries.backoff_strategy, Some(BackoffStrategy::Fixed));
    }
}
