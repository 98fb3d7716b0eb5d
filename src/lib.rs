//! jobflow: a durable orchestration engine for long multi-step jobs.
//!
//! Jobs walk a fixed twelve-step sequence through an external executor.
//! Every step outcome is appended to an audit log, failures are retried with
//! exponential backoff, and one step may park the job until an operator
//! supplies a one-time code.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod suspension;
pub mod ui;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle};
pub use error::EngineError;
