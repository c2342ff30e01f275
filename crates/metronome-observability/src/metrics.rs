// Prometheus metric handles for the orchestrator

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Counters and histograms for the observability surface. Cheap to clone;
/// all clones feed the same registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    pub tasks_created: IntCounter,
    pub runs_started: IntCounter,
    pub runs_succeeded: IntCounter,
    pub runs_failed: IntCounter,
    pub leases_taken: IntCounter,
    pub leases_expired: IntCounter,

    /// now - run_at observed at lease time, in seconds.
    pub scheduler_lag_seconds: IntGauge,

    pub step_duration_seconds: Histogram,
    pub pipeline_duration_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tasks_created =
            IntCounter::with_opts(Opts::new("metronome_tasks_created_total", "Tasks created"))
                .expect("metric opts");
        let runs_started =
            IntCounter::with_opts(Opts::new("metronome_runs_started_total", "Runs started"))
                .expect("metric opts");
        let runs_succeeded =
            IntCounter::with_opts(Opts::new("metronome_runs_succeeded_total", "Runs succeeded"))
                .expect("metric opts");
        let runs_failed =
            IntCounter::with_opts(Opts::new("metronome_runs_failed_total", "Runs failed"))
                .expect("metric opts");
        let leases_taken =
            IntCounter::with_opts(Opts::new("metronome_leases_taken_total", "Leases taken"))
                .expect("metric opts");
        let leases_expired = IntCounter::with_opts(Opts::new(
            "metronome_leases_expired_total",
            "Leases observed expired at commit time",
        ))
        .expect("metric opts");
        let scheduler_lag_seconds = IntGauge::with_opts(Opts::new(
            "metronome_scheduler_lag_seconds",
            "now - run_at observed at lease time",
        ))
        .expect("metric opts");
        let step_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "metronome_step_duration_seconds",
            "Pipeline step duration",
        ))
        .expect("metric opts");
        let pipeline_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "metronome_pipeline_duration_seconds",
            "Whole pipeline duration",
        ))
        .expect("metric opts");

        for collector in [
            Box::new(tasks_created.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(runs_started.clone()),
            Box::new(runs_succeeded.clone()),
            Box::new(runs_failed.clone()),
            Box::new(leases_taken.clone()),
            Box::new(leases_expired.clone()),
            Box::new(scheduler_lag_seconds.clone()),
            Box::new(step_duration_seconds.clone()),
            Box::new(pipeline_duration_seconds.clone()),
        ] {
            registry.register(collector).expect("register metric");
        }

        Self {
            registry: Arc::new(registry),
            tasks_created,
            runs_started,
            runs_succeeded,
            runs_failed,
            leases_taken,
            leases_expired,
            scheduler_lag_seconds,
            step_duration_seconds,
            pipeline_duration_seconds,
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn export(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
