//! # Evochain
//!
//! Staged, parallel image evolution runs.
//!
//! Every image under a source root goes through the same two remote calls:
//! a vision model describes it, and an image model renders a new picture
//! from a prompt template filled with that description. A run is either a
//! single batch pass or a chain of stages, where stage `k` feeds on the
//! outputs of stage `k-1`:
//!
//! - **Job discovery**: recursive scans that key every file by a stable
//!   identity (relative directory plus base name)
//! - **Worker pool**: round-robin partitioning with staggered worker starts
//! - **Remote client**: bounded retries of transient failures
//! - **Result ledger**: one explicit result per job and stage
//! - **Chain orchestration**: explicit run state, resume and gap policies
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use evochain::prelude::*;
//!
//! let config = ChainConfig::load("evochain.toml")?;
//! let service = HttpGenerationClient::connect(config.service.clone())?;
//! let client = RemoteGenerationClient::new(Arc::new(service), config.retry_policy());
//! let orchestrator = StageOrchestrator::new(config, Arc::new(client), Arc::new(NoOpEventSink));
//!
//! let report = orchestrator.run().await?;
//! println!("{} outputs", report.summary().succeeded);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod chain;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod ledger;
pub mod observability;
pub mod pool;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::chain::{ChainReport, RunState, StageOrchestrator, StagePhase, StageReport};
    #[cfg(feature = "http")]
    pub use crate::client::HttpGenerationClient;
    pub use crate::client::{
        GeneratedImage, GenerationService, RemoteGenerationClient, RetryPolicy, SourceImage,
    };
    pub use crate::config::{ChainConfig, GapPolicy, PromptTemplate, ServiceConfig};
    pub use crate::errors::{ChainError, ConfigError, PreconditionError, RemoteError, RemoteOperation};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::jobs::{JobDescriptor, JobId, JobSource};
    pub use crate::ledger::{JobOutcome, JobResult, LedgerSummary, ResultLedger};
    pub use crate::pool::{StageContext, WorkerPool};
    pub use std::sync::Arc;
}
