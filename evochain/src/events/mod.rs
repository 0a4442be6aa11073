//! Lifecycle events.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod names {
    /// A chain run started.
    pub const CHAIN_STARTED: &str = "chain.started";
    /// A stage's pool is about to start.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A worker finished its startup delay.
    pub const WORKER_STARTED: &str = "worker.started";
    /// A job's workflow began.
    pub const JOB_STARTED: &str = "job.started";
    /// A job reached a terminal state.
    pub const JOB_COMPLETED: &str = "job.completed";
    /// A stage passed its barrier.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// The chain stopped early because a stage produced nothing.
    pub const CHAIN_HALTED: &str = "chain.halted";
    /// The chain finished.
    pub const CHAIN_COMPLETED: &str = "chain.completed";
}
