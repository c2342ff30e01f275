// Observability shared by the api, scheduler, and worker binaries
//
// Key design decisions:
// - One prometheus Registry per process, owned by a Metrics handle that
//   components clone freely
// - tracing-subscriber configured from RUST_LOG with a per-binary default

pub mod metrics;

pub use metrics::Metrics;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing for a binary. `default_filter` applies when RUST_LOG
/// is unset (e.g. "metronome_worker=debug").
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
