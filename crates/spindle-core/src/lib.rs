//! # spindle-core
//!
//! Core library for spindle - a delegation supervisor that spawns,
//! monitors, and harvests results from child coding-agent CLI processes
//! ("harnesses" such as the `claude` and `codex` CLIs).
//!
//! Every delegated task is a **spool**: a durable JSON record on disk that
//! tracks the task through `pending -> running -> {complete, error,
//! timeout, killed}`. The supervisor never blocks on a child; a single
//! background monitor task observes completion through the child's exit
//! status and its on-disk output artifacts.
//!
//! ## Example
//!
//! ```rust,no_run
//! use spindle_core::config::SpindleConfig;
//! use spindle_core::supervisor::{SpinRequest, Supervisor};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let supervisor = Supervisor::new(SpindleConfig::from_env())?;
//! supervisor.recover_orphans();
//! let _monitor = supervisor.spawn_monitor();
//!
//! let spool_id = supervisor.spin(SpinRequest {
//!     prompt: "Summarize the open TODOs in this repo".to_string(),
//!     working_dir: Some("/home/agent/project".into()),
//!     ..SpinRequest::default()
//! })?;
//! let record = supervisor.unspool(&spool_id)?;
//! println!("{}", record.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod gate;
pub mod harness;
pub mod launcher;
pub mod monitor;
pub mod resume;
pub mod shard;
pub mod spool;
pub mod supervisor;
pub mod wait;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::SpindleConfig;
    pub use crate::harness::Harness;
    pub use crate::spool::{Permission, Spool, SpoolStatus};
    pub use crate::supervisor::{SpinRequest, Supervisor};
    pub use crate::wait::WaitMode;
}

pub use config::SpindleConfig;
pub use spool::{Permission, Spool, SpoolStatus};
pub use supervisor::{SpinRequest, Supervisor};
