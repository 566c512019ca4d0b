//! Core pipeline: code screening, sandboxed execution, and the worker
//! loop that ties claim, screen, execute, and finalise together.
//!
//! The task-store facade itself lives in `continuum-db`; this crate
//! depends on it rather than re-exporting its types wholesale.

pub mod config;
pub mod error;
pub mod sandbox;
pub mod screener;
pub mod stats;
pub mod worker;

pub use config::{SandboxConfig, WorkerConfig};
pub use error::{ConfigError, SandboxError};
pub use sandbox::SandboxManager;
pub use screener::{DenyListScreener, Screener};
pub use stats::WorkerStats;
