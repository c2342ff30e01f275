// Domain model shared by the scheduler, queue, engine, and API.

pub mod error;
pub mod pipeline;
pub mod policy;
pub mod schedule;
pub mod task;

pub use error::{ErrorKind, ValidationError};
pub use pipeline::{Pipeline, Step, StepRetryPolicy};
pub use policy::{Backoff, BackoffStrategy};
pub use schedule::{Schedule, ScheduleKind};
pub use task::{CatchUpPolicy, Task, TaskPayload, TaskPolicy, TaskStatus};
