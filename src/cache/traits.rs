//! Capabilities the engine consumes from its host.

use async_trait::async_trait;

use super::request::{Request, RequestKey, Response, StoredResponse};
use crate::error::{NetworkError, StoreError};

/// Trait for persistent keyed cache storage.
///
/// Stores are opened implicitly by name. Every `put` fully replaces the value
/// held under a key, so concurrent writers leave whichever write finished last.
#[async_trait]
pub trait CacheStorage: Send + Sync + 'static {
  /// Read the entry for a key.
  async fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<StoredResponse>, StoreError>;

  /// Write or replace the entry for a key.
  async fn put(&self, cache: &str, key: &RequestKey, value: StoredResponse) -> Result<(), StoreError>;

  /// Write a batch of entries, all or nothing.
  async fn put_all(
    &self,
    cache: &str,
    entries: Vec<(RequestKey, StoredResponse)>,
  ) -> Result<(), StoreError>;

  /// Remove the entry for a key. Returns whether it existed.
  async fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool, StoreError>;

  /// Keys held by a store. Order is backend-defined: URL order in memory,
  /// last-write order in SQLite.
  async fn keys(&self, cache: &str) -> Result<Vec<RequestKey>, StoreError>;

  /// Names of every store that currently exists.
  async fn cache_names(&self) -> Result<Vec<String>, StoreError>;

  /// Drop a store and its entries. Returns whether it existed.
  async fn delete_cache(&self, cache: &str) -> Result<bool, StoreError>;

  /// Look a key up in each named store in turn, returning the first hit.
  async fn match_in(
    &self,
    caches: &[&str],
    key: &RequestKey,
  ) -> Result<Option<StoredResponse>, StoreError> {
    for cache in caches {
      if let Some(hit) = self.get(cache, key).await? {
        return Ok(Some(hit));
      }
    }
    Ok(None)
  }
}

/// Network fetch capability.
///
/// Implementations enforce their own timeout. A non-2xx status is a response,
/// not an error.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}
