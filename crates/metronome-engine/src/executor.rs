// Pipeline executor: linear, one step at a time
//
// Deterministic given identical task definition, params, tool responses and
// `now`: the context evolves in declaration order and nothing else feeds
// into the output.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use metronome_core::{Backoff, BackoffStrategy, Pipeline, Step};

use crate::context::RunContext;
use crate::error::EngineError;
use crate::template::{eval_condition, render_value};
use crate::tools::{ToolError, ToolRegistry};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Applied when a step declares no timeout.
    pub default_step_timeout: Duration,
    /// Backoff between step-local retry attempts.
    pub step_backoff: Backoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(30),
            step_backoff: Backoff::default(),
        }
    }
}

/// Successful pipeline execution: the final steps map.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub steps: Map<String, Value>,
}

/// Failed pipeline execution: the error plus the outputs of the steps that
/// ran before the failure, with a `failed_step` marker appended.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub error: EngineError,
    pub steps: Map<String, Value>,
}

/// Interprets one pipeline against the tool registry.
#[derive(Clone)]
pub struct PipelineExecutor {
    registry: Arc<ToolRegistry>,
    config: EngineConfig,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute the pipeline. `params` come from the task payload, merged
    /// with per-run `overrides`; `now` is the run's start instant.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        params: &Map<String, Value>,
        overrides: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionReport, ExecutionFailure> {
        let mut ctx = RunContext::new(params, overrides, now);

        for step in &pipeline.steps {
            if let Some(condition) = &step.condition {
                match eval_condition(condition, &ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(step_id = %step.id, "step skipped by condition");
                        ctx.record_step(step.output_name(), json!({ "skipped": true }));
                        continue;
                    }
                    Err(e) => {
                        return Err(Self::fail(
                            ctx,
                            EngineError::Template {
                                step: step.id.clone(),
                                detail: e.detail,
                            },
                        ));
                    }
                }
            }

            let args = match render_value(&Value::Object(step.with.clone()), &ctx) {
                Ok(v) => v,
                Err(e) => {
                    return Err(Self::fail(
                        ctx,
                        EngineError::Template {
                            step: step.id.clone(),
                            detail: e.detail,
                        },
                    ));
                }
            };

            match self.invoke_with_retries(step, args).await {
                Ok(output) => ctx.record_step(step.output_name(), output),
                Err(error) => return Err(Self::fail(ctx, error)),
            }
        }

        Ok(ExecutionReport {
            steps: ctx.into_steps(),
        })
    }

    /// Invoke the step's tool, applying the step-local retry policy.
    /// Exhausting local retries elevates to pipeline-level failure.
    async fn invoke_with_retries(&self, step: &Step, args: Value) -> Result<Value, EngineError> {
        let budget = step.retries.as_ref().map(|r| r.max_retries).unwrap_or(0);
        let strategy = step
            .retries
            .as_ref()
            .and_then(|r| r.backoff_strategy)
            .unwrap_or(BackoffStrategy::ExponentialJitter);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.invoke_once(step, args.clone()).await {
                Ok(output) => return Ok(output),
                Err(error) if attempt <= budget => {
                    let delay = self.config.step_backoff.delay(strategy, attempt);
                    warn!(
                        step_id = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "step failed, retrying locally"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn invoke_once(&self, step: &Step, args: Value) -> Result<Value, EngineError> {
        let timeout = step
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_step_timeout);

        match tokio::time::timeout(timeout, self.registry.invoke(&step.uses, args)).await {
            Err(_elapsed) => Err(EngineError::Timeout {
                step: step.id.clone(),
                seconds: timeout.as_secs(),
            }),
            Ok(Err(ToolError::Unknown(address))) => Err(EngineError::Tool {
                step: step.id.clone(),
                detail: format!("no tool registered at address: {}", address),
            }),
            Ok(Err(ToolError::Failed(detail))) => Err(EngineError::Tool {
                step: step.id.clone(),
                detail,
            }),
            Ok(Ok(output)) => Ok(output),
        }
    }

    fn fail(ctx: RunContext, error: EngineError) -> ExecutionFailure {
        let mut steps = ctx.into_steps();
        steps.insert(
            "failed_step".to_string(),
            json!({
                "id": error.step(),
                "error_kind": error.kind().to_string(),
                "error": error.to_string(),
            }),
        );
        ExecutionFailure { error, steps }
    }
}
