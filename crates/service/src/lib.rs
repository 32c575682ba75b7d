//! Service infrastructure for a podnet pod.
//!
//! - Config (defaults overlaid by a TOML file)
//! - Database (SQLite implementation of the pod storage provider)
//! - State (registry, dispatcher and iroh endpoint wired from a config)

pub mod config;
pub mod database;
pub mod state;

// Re-export key types for convenience
pub use config::{Config, ConfigError};
pub use database::{Database, DatabaseError, DatabaseSetupError};
pub use state::{State as ServiceState, StateSetupError};
