//! Error types for the cache engine.

use thiserror::Error;

/// Failure reported by the network capability.
///
/// Timeouts and connection failures are not distinguished by the strategies.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
  #[error("request timed out: {0}")]
  Timeout(String),

  #[error("connection failed: {0}")]
  Connection(String),
}

/// Failure reported by the persistent keyed store.
#[derive(Error, Debug, Clone)]
#[error("cache storage unavailable: {0}")]
pub struct StoreError(pub String);

/// Errors surfaced by the engine.
#[derive(Error, Debug)]
pub enum EngineError {
  /// One or more install-time precache fetches failed.
  #[error("precache failed for generation {version}: {}", failed.join(", "))]
  PrecacheFailure {
    version: String,
    /// The URLs that could not be fetched or stored
    failed: Vec<String>,
  },

  /// Network failed and nothing could stand in for it.
  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  /// Persistent storage could not be read or written.
  #[error("cache storage unavailable: {0}")]
  StoreUnavailable(String),

  /// Network and cache both missed and the strategy has no fallback.
  #[error("no cached fallback for {url}: {reason}")]
  NoFallbackAvailable { url: String, reason: String },

  /// A request or control message could not be interpreted.
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// A lifecycle operation named a generation the engine does not know.
  #[error("unknown generation: {0}")]
  UnknownGeneration(String),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

impl From<NetworkError> for EngineError {
  fn from(err: NetworkError) -> Self {
    EngineError::NetworkUnavailable(err.to_string())
  }
}

impl From<StoreError> for EngineError {
  fn from(err: StoreError) -> Self {
    EngineError::StoreUnavailable(err.0)
  }
}

/// A specialized `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
