// Worker: leases due work, runs the pipeline engine, records runs

pub mod worker;

pub use worker::{Worker, WorkerConfig};
