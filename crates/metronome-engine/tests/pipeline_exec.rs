// End-to-end pipeline execution against the built-in tool registry.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use metronome_core::{Backoff, ErrorKind, Pipeline};
use metronome_engine::{
    EngineConfig, PipelineExecutor, Tool, ToolError, ToolRegistry,
};
use serde_json::{json, Map, Value};

fn pipeline(v: Value) -> Pipeline {
    serde_json::from_value(v).unwrap()
}

fn params(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

fn executor() -> PipelineExecutor {
    PipelineExecutor::new(Arc::new(ToolRegistry::builtin())).with_config(EngineConfig {
        default_step_timeout: Duration::from_secs(5),
        step_backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(50)),
    })
}

/// Fails a configurable number of times before succeeding.
struct FlakyTool {
    failures_remaining: AtomicU32,
}

#[async_trait]
impl Tool for FlakyTool {
    fn address(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Fail N times, then succeed."
    }

    async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ToolError::Failed("simulated outage".into()));
        }
        Ok(json!({ "ok": true }))
    }
}

/// Sleeps longer than any reasonable step timeout.
struct StuckTool;

#[async_trait]
impl Tool for StuckTool {
    fn address(&self) -> &str {
        "stuck"
    }

    fn description(&self) -> &str {
        "Never finish in time."
    }

    async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn step_output_flows_into_template() {
    let exec = executor();
    let p = pipeline(json!([
        {"id": "a", "uses": "echo", "with": {"message": "hi"}},
        {"id": "b", "uses": "log", "with": {"text": "got ${steps.a.message} at ${now}"}}
    ]));
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    let report = exec
        .execute(&p, &Map::new(), &Map::new(), now)
        .await
        .expect("pipeline succeeds");

    assert_eq!(report.steps["a"], json!({"message": "hi"}));
    assert_eq!(
        report.steps["b"]["text"],
        json!("got hi at 2024-06-01T12:00:00Z")
    );
}

#[tokio::test]
async fn missing_path_fails_without_retry() {
    let exec = executor();
    let p = pipeline(json!([
        {"id": "a", "uses": "echo", "with": {"value": "${steps.missing.value}"},
         "retries": {"max_retries": 5}}
    ]));

    let failure = exec
        .execute(&p, &Map::new(), &Map::new(), Utc::now())
        .await
        .expect_err("render error is fatal");

    assert_eq!(failure.error.kind(), ErrorKind::Template);
    // Template errors skip the retry loop entirely; output carries the marker.
    assert_eq!(failure.steps["failed_step"]["id"], json!("a"));
    assert_eq!(failure.steps["failed_step"]["error_kind"], json!("template"));
}

#[tokio::test]
async fn falsy_condition_records_skip_placeholder() {
    let exec = executor();
    let p = pipeline(json!([
        {"id": "gate", "uses": "echo", "with": {"v": 1}, "if": "params.enabled"},
        {"id": "after", "uses": "echo", "with": {"v": 2}}
    ]));

    let report = exec
        .execute(&p, &params(json!({"enabled": false})), &Map::new(), Utc::now())
        .await
        .unwrap();

    assert_eq!(report.steps["gate"], json!({"skipped": true}));
    assert_eq!(report.steps["after"], json!({"v": 2}));
}

#[tokio::test]
async fn save_as_names_the_output_slot() {
    let exec = executor();
    let p = pipeline(json!([
        {"id": "fetch", "uses": "echo", "with": {"payload": 42}, "save_as": "data"},
        {"id": "use", "uses": "echo", "with": {"copy": "${steps.data.payload}"}}
    ]));

    let report = exec
        .execute(&p, &Map::new(), &Map::new(), Utc::now())
        .await
        .unwrap();

    assert!(report.steps.contains_key("data"));
    assert_eq!(report.steps["use"], json!({"copy": 42}));
}

#[tokio::test]
async fn step_local_retries_recover_from_transient_failures() {
    let mut registry = ToolRegistry::builtin();
    registry.register(Arc::new(FlakyTool {
        failures_remaining: AtomicU32::new(2),
    }));
    let exec = PipelineExecutor::new(Arc::new(registry)).with_config(EngineConfig {
        default_step_timeout: Duration::from_secs(5),
        step_backoff: Backoff::new(Duration::from_millis(2), Duration::from_millis(20)),
    });

    let p = pipeline(json!([
        {"id": "a", "uses": "flaky", "with": {}, "retries": {"max_retries": 3, "backoff_strategy": "fixed"}}
    ]));

    let report = exec
        .execute(&p, &Map::new(), &Map::new(), Utc::now())
        .await
        .expect("third attempt succeeds");
    assert_eq!(report.steps["a"], json!({"ok": true}));
}

#[tokio::test]
async fn exhausted_local_retries_elevate_to_pipeline_failure() {
    let mut registry = ToolRegistry::builtin();
    registry.register(Arc::new(FlakyTool {
        failures_remaining: AtomicU32::new(10),
    }));
    let exec = PipelineExecutor::new(Arc::new(registry)).with_config(EngineConfig {
        default_step_timeout: Duration::from_secs(5),
        step_backoff: Backoff::new(Duration::from_millis(2), Duration::from_millis(20)),
    });

    let p = pipeline(json!([
        {"id": "a", "uses": "flaky", "with": {}, "retries": {"max_retries": 1, "backoff_strategy": "fixed"}}
    ]));

    let failure = exec
        .execute(&p, &Map::new(), &Map::new(), Utc::now())
        .await
        .expect_err("budget exhausted");
    assert_eq!(failure.error.kind(), ErrorKind::Tool);
}

#[tokio::test(start_paused = true)]
async fn step_timeout_is_a_timeout_error() {
    let mut registry = ToolRegistry::builtin();
    registry.register(Arc::new(StuckTool));
    let exec = PipelineExecutor::new(Arc::new(registry));

    let p = pipeline(json!([
        {"id": "a", "uses": "stuck", "with": {}, "timeout": 1}
    ]));

    let failure = exec
        .execute(&p, &Map::new(), &Map::new(), Utc::now())
        .await
        .expect_err("stuck tool times out");
    assert_eq!(failure.error.kind(), ErrorKind::Timeout);
    assert_eq!(failure.steps["failed_step"]["error_kind"], json!("timeout"));
}

#[tokio::test]
async fn failure_keeps_outputs_of_earlier_steps() {
    let exec = executor();
    let p = pipeline(json!([
        {"id": "a", "uses": "echo", "with": {"v": 1}},
        {"id": "b", "uses": "echo", "with": {"broken": "${steps.nope.x}"}},
        {"id": "c", "uses": "echo", "with": {"v": 3}}
    ]));

    let failure = exec
        .execute(&p, &Map::new(), &Map::new(), Utc::now())
        .await
        .unwrap_err();

    assert_eq!(failure.steps["a"], json!({"v": 1}));
    assert!(!failure.steps.contains_key("b"));
    assert!(!failure.steps.contains_key("c"));
    assert_eq!(failure.steps["failed_step"]["id"], json!("b"));
}

#[tokio::test]
async fn replay_is_byte_identical() {
    let exec = executor();
    let p = pipeline(json!([
        {"id": "seed", "uses": "echo", "with": {"n": 1, "tags": ["x", "y"]}},
        {"id": "derive", "uses": "echo", "with": {"copied": "${steps.seed.tags}", "at": "${now}"}},
        {"id": "note", "uses": "log", "with": {"text": "n=${steps.seed.n}"}}
    ]));
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let seed_params = params(json!({"env": "test"}));

    let first = exec
        .execute(&p, &seed_params, &Map::new(), now)
        .await
        .unwrap();
    let second = exec
        .execute(&p, &seed_params, &Map::new(), now)
        .await
        .unwrap();

    let a = serde_json::to_string(&first.steps).unwrap();
    let b = serde_json::to_string(&second.steps).unwrap();
    assert_eq!(a, b);

    // Output keys follow declaration order.
    let keys: Vec<&String> = first.steps.keys().collect();
    assert_eq!(keys, vec!["seed", "derive", "note"]);
}

#[tokio::test]
async fn params_overrides_reach_templates() {
    let exec = executor();
    let p = pipeline(json!([
        {"id": "a", "uses": "echo", "with": {"who": "${params.who}"}}
    ]));

    let report = exec
        .execute(
            &p,
            &params(json!({"who": "default"})),
            &params(json!({"who": "override"})),
            Utc::now(),
        )
        .await
        .unwrap();

    assert_eq!(report.steps["a"], json!({"who": "override"}));
}
