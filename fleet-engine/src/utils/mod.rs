//! Utility modules for the reconciliation engine.

pub mod errors;
pub mod logger;

pub use errors::{ApplyError, ConfigError, SessionError};
