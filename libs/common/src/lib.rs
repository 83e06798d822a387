//! Shared service plumbing
//!
//! - logging bootstrap (console + daily rolling file)
//! - layered configuration loading (defaults, YAML, environment)
//! - graceful shutdown signals

pub mod config;
pub mod error;
pub mod logging;
pub mod shutdown;

pub use config::load_config;
pub use error::{Error, Result};
pub use shutdown::{wait_for_shutdown, ShutdownSignal};
