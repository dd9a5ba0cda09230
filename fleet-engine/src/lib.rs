//! Fleet State Reconciliation Engine
//!
//! Keeps a fleet of hosts converged on one versioned manifest: detects drift
//! over a single SSH session per host, applies only the corrective actions
//! needed, and rolls new manifest versions out through preview, canary and
//! staged batches.

pub mod appliers;
pub mod config;
pub mod db;
pub mod lifecycle;
pub mod manifest;
pub mod models;
pub mod pipeline;
pub mod rollout;
pub mod session;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use manifest::{Manifest, ManifestRegistry};
pub use pipeline::{HostOutcome, Pipeline, ReconcileResult, RunMode};
pub use rollout::Orchestrator;
pub use utils::errors::{ApplyError, ConfigError, SessionError};
