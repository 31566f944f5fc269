//! Control messages, replies and client broadcasts.
//!
//! Wire format is JSON with an upper-case `type` tag, e.g.
//! `{"type":"UPDATE_CACHE","data":{"url":"/api/x","content":{...}}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::EngineError;

/// Messages received from connected application instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
  GetVersion,
  ClearCache,
  UpdateCache(UpdateCache),
  GetCacheInfo,
  SyncNow,
  CheckUpdates,
  Ping,
}

impl ControlMessage {
  pub fn from_json(raw: &str) -> Result<Self, EngineError> {
    serde_json::from_str(raw)
      .map_err(|e| EngineError::InvalidRequest(format!("Unrecognized control message: {}", e)))
  }
}

/// Payload of `UPDATE_CACHE`: `content` is stored as JSON under `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCache {
  pub url: String,
  pub content: serde_json::Value,
}

/// Direct replies to control messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
  Version(VersionInfo),
  CacheInfo(CacheInfo),
  Pong(Pong),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
  pub version: String,
  pub cache_names: Vec<String>,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
  pub cache_info: BTreeMap<String, CacheSummary>,
  pub total_caches: usize,
}

/// Entry count of one store and its first few URLs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSummary {
  pub size: usize,
  pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pong {
  pub pong: bool,
  pub version: String,
}

/// Lifecycle notifications broadcast to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
  Installing {
    version: String,
  },
  Activated {
    version: String,
  },
  #[serde(rename_all = "camelCase")]
  UpdateAvailable {
    current_version: String,
    new_version: String,
  },
  SyncComplete {
    timestamp: DateTime<Utc>,
  },
  CacheCleared {
    timestamp: DateTime<Utc>,
  },
}
