//! Detached background work: store write-backs and revalidation.
//!
//! Everything spawned here may outlive the request that started it. Failures
//! are observed only through logs, never through the caller's result.
//!
//! Background writes go through [`BackgroundTasks::put_live`], which drops
//! writes into stores retired by an activation sweep. A write that started
//! against the previous generation therefore cannot recreate its stores.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::request::{Request, RequestKey, Response, StoredResponse};
use super::traits::{CacheStorage, Network};
use super::CacheNames;
use crate::error::{EngineError, StoreError};

/// Task-queue capability for fire-and-forget work.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
  tracker: TaskTracker,
  /// Stores removed by an activation; writes into them are dropped
  retired: Arc<RwLock<BTreeSet<String>>>,
}

impl BackgroundTasks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `fut` to completion independently of the caller.
  ///
  /// Dropping the returned handle does not cancel the task.
  pub fn spawn_detached<F>(&self, name: &'static str, fut: F) -> JoinHandle<()>
  where
    F: Future<Output = Result<(), EngineError>> + Send + 'static,
  {
    self.tracker.spawn(async move {
      if let Err(e) = fut.await {
        warn!(task = name, error = %e, "background task failed");
      }
    })
  }

  /// Number of detached tasks still running.
  pub fn pending(&self) -> usize {
    self.tracker.len()
  }

  /// Wait until every task spawned so far has finished.
  pub async fn wait_idle(&self) {
    self.tracker.close();
    self.tracker.wait().await;
    self.tracker.reopen();
  }

  /// Write `value` unless `cache` was retired. Returns whether it was written.
  pub async fn put_live<S: CacheStorage>(
    &self,
    storage: &S,
    cache: &str,
    key: &RequestKey,
    value: StoredResponse,
  ) -> Result<bool, StoreError> {
    let retired = self.retired.read().await;
    if retired.contains(cache) {
      debug!(cache = %cache, key = %key, "dropping write to retired store");
      return Ok(false);
    }
    storage.put(cache, key, value).await?;
    Ok(true)
  }

  /// Delete every store not in `keep` and retire it, along with `superseded`.
  ///
  /// Holds the write side of the barrier for the whole sweep, so no gated
  /// write lands between a store's deletion and its retirement. Returns the
  /// deleted store names.
  pub async fn retire<S: CacheStorage>(
    &self,
    storage: &S,
    keep: &CacheNames,
    superseded: &[String],
  ) -> Result<Vec<String>, StoreError> {
    let mut retired = self.retired.write().await;
    retired.extend(superseded.iter().filter(|n| !keep.contains(n)).cloned());

    let mut deleted = Vec::new();
    for name in storage.cache_names().await? {
      if keep.contains(&name) {
        continue;
      }
      retired.insert(name.clone());
      storage.delete_cache(&name).await?;
      deleted.push(name);
    }

    for name in keep.all() {
      retired.remove(name);
    }
    Ok(deleted)
  }

  /// Accept writes into `names` again, e.g. when a retired version is reinstalled.
  pub async fn reinstate(&self, names: &CacheNames) {
    let mut retired = self.retired.write().await;
    for name in names.all() {
      retired.remove(name);
    }
  }

  pub async fn is_retired(&self, cache: &str) -> bool {
    self.retired.read().await.contains(cache)
  }
}

/// Write a response into a store on a detached task and wait for it.
///
/// The write still completes if the waiting caller is dropped. A failed write
/// is logged; it never fails the request.
pub async fn write_back<S: CacheStorage>(
  tasks: &BackgroundTasks,
  storage: &Arc<S>,
  cache: &str,
  key: &RequestKey,
  response: &Response,
) {
  let gate = tasks.clone();
  let storage = Arc::clone(storage);
  let cache = cache.to_string();
  let key = key.clone();
  let value = StoredResponse::capture(response.clone());

  let handle = tasks.spawn_detached("write_back", async move {
    if gate.put_live(storage.as_ref(), &cache, &key, value).await? {
      debug!(cache = %cache, key = %key, "stored response");
    }
    Ok(())
  });

  // Store errors are logged by the task itself; only a panic reaches here
  if let Err(e) = handle.await {
    warn!(error = %e, "write-back task did not complete");
  }
}

/// Refresh a cached entry in the background.
///
/// Fetches `request`; a 2xx response overwrites the entry, anything else is
/// discarded. Never retried; overlapping revalidations of one key are allowed
/// because store writes are last-writer-wins.
pub fn revalidate<S: CacheStorage, N: Network>(
  tasks: &BackgroundTasks,
  storage: &Arc<S>,
  network: &Arc<N>,
  cache: &str,
  request: Request,
) -> JoinHandle<()> {
  let gate = tasks.clone();
  let storage = Arc::clone(storage);
  let network = Arc::clone(network);
  let cache = cache.to_string();

  tasks.spawn_detached("revalidate", async move {
    let Some(key) = request.key() else {
      return Ok(());
    };

    match network.fetch(&request).await {
      Ok(response) if response.is_success() => {
        let value = StoredResponse::capture(response);
        if gate.put_live(storage.as_ref(), &cache, &key, value).await? {
          debug!(key = %key, "revalidated");
        }
      }
      Ok(response) => {
        debug!(key = %key, status = response.status, "revalidation discarded");
      }
      Err(e) => {
        debug!(key = %key, error = %e, "revalidation failed");
      }
    }
    Ok(())
  })
}
