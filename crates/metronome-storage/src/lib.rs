// Postgres storage layer with sqlx, plus an in-memory twin for tests

pub mod memory;
pub mod models;
pub mod postgres;
pub mod queue;
pub mod store;

pub use memory::InMemoryWorkStore;
pub use models::*;
pub use postgres::PostgresWorkStore;
pub use queue::{FailOutcome, WorkQueue};
pub use store::{StoreError, WorkStore};
