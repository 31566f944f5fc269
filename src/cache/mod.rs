//! Versioned cache stores and the strategies that serve from them.
//!
//! This module provides:
//! - Request/response values and the `RequestKey` store identity
//! - The storage and network capabilities, with SQLite and in-memory stores
//! - Request classification and the per-class caching strategies
//! - Detached background revalidation

pub mod classify;
pub mod request;
pub mod revalidate;
pub mod storage;
pub mod strategy;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{Classifier, ResourceClass};
pub use request::{Method, Request, RequestKey, Response, StoredResponse};
pub use revalidate::BackgroundTasks;
pub use storage::{MemoryStorage, SqliteStorage};
pub use strategy::{Strategy, StrategyTable};
pub use traits::{CacheStorage, Network};

use serde::Serialize;

/// Logical namespace of a store within a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
  Static,
  Runtime,
  Data,
}

impl Namespace {
  pub const ALL: [Namespace; 3] = [Namespace::Static, Namespace::Runtime, Namespace::Data];

  fn label(self) -> &'static str {
    match self {
      Namespace::Static => "static",
      Namespace::Runtime => "runtime",
      Namespace::Data => "data",
    }
  }
}

/// Names of the three stores owned by one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  pub static_cache: String,
  pub runtime: String,
  pub data: String,
}

impl CacheNames {
  /// Store names are `{prefix}-{namespace}-v{version}`.
  pub fn for_version(prefix: &str, version: &str) -> Self {
    let name = |ns: Namespace| format!("{}-{}-v{}", prefix, ns.label(), version);
    Self {
      static_cache: name(Namespace::Static),
      runtime: name(Namespace::Runtime),
      data: name(Namespace::Data),
    }
  }

  pub fn get(&self, namespace: Namespace) -> &str {
    match namespace {
      Namespace::Static => &self.static_cache,
      Namespace::Runtime => &self.runtime,
      Namespace::Data => &self.data,
    }
  }

  pub fn all(&self) -> [&str; 3] {
    [&self.static_cache, &self.runtime, &self.data]
  }

  pub fn contains(&self, name: &str) -> bool {
    self.all().contains(&name)
  }

  /// Version tag of a data store name produced by `for_version`.
  pub fn data_version<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    name
      .strip_prefix(prefix)?
      .strip_prefix("-data-v")
      .filter(|v| !v.is_empty())
  }
}
