//! swcache: a versioned offline cache engine.
//!
//! Requests are classified into resource classes, each served by a caching
//! strategy against the stores of the active generation. New generations are
//! precached at install time and swept in atomically at activation.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod messages;
pub mod network;

pub use config::EngineConfig;
pub use engine::{CacheEngine, FetchOutcome};
pub use error::{EngineError, NetworkError, StoreError};
