//! Request processing pipeline.
//!
//! Connection handlers turn file commands into [`Task`]s and submit them to
//! the [`TaskQueue`]; a fixed [`WorkerPool`] executes them against the
//! metadata and disk stores and signals completion back to the handler.

pub mod queue;
pub mod shutdown;
pub mod task;
pub mod worker;

pub use queue::{EnqueueError, QueueOrder, WorkQueue};
pub use shutdown::Shutdown;
pub use task::{Command, Completion, Job, ReplySink, Task, TaskHandle, TaskOutcome, TaskQueue};
pub use worker::{Worker, WorkerPool};
