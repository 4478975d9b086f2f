//! Broker-backed task queue and event-stream substrate.
//!
//! Jobs are pushed onto a FIFO list and consumed by workers via blocking pop;
//! each job has a status hash with TTL, a pub/sub channel carrying its typed
//! event stream, and an entry in the active-jobs set while it is in flight.

mod models;
mod task_queue;
mod watchdog;

pub use models::{EnqueuePayload, JobStage, JobStatus, QueueEvent};
pub use task_queue::{QueueEventStream, STALE_HEARTBEAT_ERROR, TaskQueue};
pub use watchdog::Watchdog;
