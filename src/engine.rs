//! The cache engine: one entry point per lifecycle phase.
//!
//! `on_install`, `on_activate`, `on_fetch` and `on_message` drive the pure
//! lifecycle in [`crate::lifecycle`] and the strategies in
//! [`crate::cache::strategy`] against the storage and network capabilities.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::classify::in_scope;
use crate::cache::strategy::{Served, ServeContext, Source};
use crate::cache::{
  BackgroundTasks, CacheNames, CacheStorage, Classifier, Network, Request, RequestKey,
  ResourceClass, Response, StoredResponse, StrategyTable,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lifecycle::{transition, Effect, Generation, LifecycleEvent, LifecycleState, Phase};
use crate::messages::{
  CacheInfo, CacheSummary, ClientEvent, ControlMessage, Pong, Reply, UpdateCache, VersionInfo,
};

/// URLs listed per store in a cache summary.
pub const SUMMARY_URLS: usize = 10;

const EVENT_CAPACITY: usize = 64;

/// Per-generation record kept in the data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
  pub version: String,
  pub installed_at: DateTime<Utc>,
  pub last_sync: DateTime<Utc>,
}

/// Result of routing one request through the engine.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Handled by the strategy for `class`
  Served { class: ResourceClass, served: Served },
  /// Not ours to handle (non-GET, out of scope, or no active generation)
  Passthrough(Response),
}

impl FetchOutcome {
  pub fn response(&self) -> &Response {
    match self {
      FetchOutcome::Served { served, .. } => &served.response,
      FetchOutcome::Passthrough(response) => response,
    }
  }

  pub fn into_response(self) -> Response {
    match self {
      FetchOutcome::Served { served, .. } => served.response,
      FetchOutcome::Passthrough(response) => response,
    }
  }

  pub fn source(&self) -> Option<Source> {
    match self {
      FetchOutcome::Served { served, .. } => Some(served.source),
      FetchOutcome::Passthrough(_) => None,
    }
  }
}

/// Versioned cache engine.
///
/// Cheap to clone; clones share storage, lifecycle state and background tasks.
pub struct CacheEngine<S: CacheStorage, N: Network> {
  config: Arc<EngineConfig>,
  storage: Arc<S>,
  network: Arc<N>,
  classifier: Arc<Classifier>,
  strategies: Arc<StrategyTable>,
  tasks: BackgroundTasks,
  state: Arc<Mutex<LifecycleState>>,
  events: broadcast::Sender<ClientEvent>,
  offline_document: RequestKey,
  metadata_key: RequestKey,
}

impl<S: CacheStorage, N: Network> Clone for CacheEngine<S, N> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      classifier: Arc::clone(&self.classifier),
      strategies: Arc::clone(&self.strategies),
      tasks: self.tasks.clone(),
      state: Arc::clone(&self.state),
      events: self.events.clone(),
      offline_document: self.offline_document.clone(),
      metadata_key: self.metadata_key.clone(),
    }
  }
}

impl<S: CacheStorage, N: Network> CacheEngine<S, N> {
  pub fn new(config: EngineConfig, storage: S, network: N) -> Result<Self> {
    Self::with_shared(config, Arc::new(storage), Arc::new(network))
  }

  /// Build an engine over capabilities shared with other engines.
  pub fn with_shared(config: EngineConfig, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    let offline_document = resolve_key(&config, &config.offline_document)?;
    let metadata_key = resolve_key(&config, &config.metadata_key)?;
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    Ok(Self {
      classifier: Arc::new(Classifier::new(&config)),
      strategies: Arc::new(StrategyTable::default()),
      state: Arc::new(Mutex::new(LifecycleState::new(config.skip_waiting))),
      config: Arc::new(config),
      storage,
      network,
      tasks: BackgroundTasks::new(),
      events,
      offline_document,
      metadata_key,
    })
  }

  /// Replace the class-to-strategy table.
  pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
    self.strategies = Arc::new(strategies);
    self
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn tasks(&self) -> &BackgroundTasks {
    &self.tasks
  }

  /// Receive lifecycle broadcasts from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
    self.events.subscribe()
  }

  /// Snapshot of the lifecycle state.
  pub fn state(&self) -> Result<LifecycleState> {
    Ok(self.lock_state()?.clone())
  }

  pub fn current_generation(&self) -> Result<Option<Generation>> {
    Ok(self.lock_state()?.current().cloned())
  }

  /// The generation new requests are routed to (activating, else active).
  pub fn serving_generation(&self) -> Result<Option<Generation>> {
    Ok(self.lock_state()?.serving().cloned())
  }

  fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, LifecycleState>> {
    self
      .state
      .lock()
      .map_err(|e| EngineError::StoreUnavailable(format!("Lifecycle lock poisoned: {}", e)))
  }

  // ==========================================================================
  // Lifecycle entry points
  // ==========================================================================

  /// Install the configured generation: precache, then wait or activate.
  ///
  /// Returns the phase the generation ended in.
  pub async fn on_install(&self) -> Result<Phase> {
    let version = self.config.version.clone();
    info!(version = %version, "installing");

    self
      .dispatch(LifecycleEvent::InstallStarted {
        version: version.clone(),
        names: self.config.cache_names(),
      })
      .await?;

    let generation = self
      .lock_state()?
      .generation(&version)
      .cloned()
      .ok_or_else(|| EngineError::UnknownGeneration(version.clone()))?;

    if generation.phase == Phase::Failed {
      error!(version = %version, failed = ?generation.failures, "precache failed");
      return Err(EngineError::PrecacheFailure {
        version,
        failed: generation.failures,
      });
    }
    Ok(generation.phase)
  }

  /// Promote the waiting generation, sweeping every other generation's stores.
  ///
  /// Returns the version now active, if any.
  pub async fn on_activate(&self) -> Result<Option<String>> {
    self.dispatch(LifecycleEvent::SkipWaiting).await?;
    Ok(self.current_generation()?.map(|g| g.version))
  }

  /// Produce the single response for an inbound request.
  pub async fn on_fetch(&self, request: &Request) -> Result<FetchOutcome> {
    let Some(key) = request.key() else {
      return self.passthrough(request).await;
    };
    if !in_scope(&request.url, &self.config.origin, &self.config.allowed_hosts) {
      return self.passthrough(request).await;
    }
    // The metadata record is internal; never serve or overwrite it
    if key == self.metadata_key {
      return self.passthrough(request).await;
    }
    // Read per request so promotion reroutes new requests immediately
    let Some(generation) = self.serving_generation()? else {
      return self.passthrough(request).await;
    };

    let class = self.classifier.classify(request);
    let route = self.strategies.route(class);
    debug!(key = %key, class = %class, "serving");

    let ctx = ServeContext {
      storage: &self.storage,
      network: &self.network,
      tasks: &self.tasks,
      names: &generation.names,
      offline_document: &self.offline_document,
    };
    let served = route.strategy.serve(request, &key, route.namespace, &ctx).await?;

    if class == ResourceClass::ApiData
      && served.source == Source::Network
      && served.response.is_success()
    {
      let engine = self.clone();
      self.tasks.spawn_detached("last_sync", async move {
        engine.touch_last_sync(&generation).await
      });
    }

    Ok(FetchOutcome::Served { class, served })
  }

  /// Handle a control message; some messages have a direct reply.
  pub async fn on_message(&self, message: ControlMessage) -> Result<Option<Reply>> {
    debug!(message = ?message, "control message");

    match message {
      ControlMessage::SkipWaiting => {
        self.on_activate().await?;
        Ok(None)
      }
      ControlMessage::GetVersion => Ok(Some(Reply::Version(self.version_info()?))),
      ControlMessage::ClearCache => {
        self.clear_all().await?;
        Ok(None)
      }
      ControlMessage::UpdateCache(UpdateCache { url, content }) => {
        self.update_entry(&url, &content).await?;
        Ok(None)
      }
      ControlMessage::GetCacheInfo => {
        Ok(Some(Reply::CacheInfo(self.cache_summary(SUMMARY_URLS).await?)))
      }
      ControlMessage::SyncNow => {
        self.sync_now();
        Ok(None)
      }
      ControlMessage::CheckUpdates => {
        self.check_updates();
        Ok(None)
      }
      ControlMessage::Ping => Ok(Some(Reply::Pong(Pong {
        pong: true,
        version: self.active_version()?,
      }))),
    }
  }

  // ==========================================================================
  // Admin operations
  // ==========================================================================

  /// Version and store names of the active generation (or the configured one).
  pub fn version_info(&self) -> Result<VersionInfo> {
    let names = match self.current_generation()? {
      Some(generation) => generation.names,
      None => self.config.cache_names(),
    };

    Ok(VersionInfo {
      version: self.active_version()?,
      cache_names: names.all().iter().map(|n| n.to_string()).collect(),
      timestamp: Utc::now(),
    })
  }

  fn active_version(&self) -> Result<String> {
    Ok(
      self
        .current_generation()?
        .map(|g| g.version)
        .unwrap_or_else(|| self.config.version.clone()),
    )
  }

  /// Delete every store unconditionally. Idempotent.
  pub async fn clear_all(&self) -> Result<()> {
    let names = self.storage.cache_names().await?;
    for name in &names {
      self.storage.delete_cache(name).await?;
    }
    info!(count = names.len(), "cleared all caches");

    self.broadcast(ClientEvent::CacheCleared {
      timestamp: Utc::now(),
    });
    Ok(())
  }

  /// Store `content` as a JSON entry in the active data store.
  pub async fn update_entry(&self, url: &str, content: &serde_json::Value) -> Result<()> {
    let key = resolve_key(&self.config, url)?;
    let names = self.serving_names()?;
    let response = Response::json(200, content)?;

    let stored = self
      .tasks
      .put_live(self.storage.as_ref(), &names.data, &key, StoredResponse::capture(response))
      .await?;
    if stored {
      debug!(key = %key, "updated data entry");
    }
    Ok(())
  }

  /// Entry count and first `limit` URLs of every store.
  pub async fn cache_summary(&self, limit: usize) -> Result<CacheInfo> {
    let names = self.storage.cache_names().await?;
    let mut cache_info = BTreeMap::new();

    for name in &names {
      let keys = self.storage.keys(name).await?;
      cache_info.insert(
        name.clone(),
        CacheSummary {
          size: keys.len(),
          urls: keys.iter().take(limit).map(|k| k.url().to_string()).collect(),
        },
      );
    }

    Ok(CacheInfo {
      cache_info,
      total_caches: names.len(),
    })
  }

  /// Re-fetch synced data entries in the background, then broadcast completion.
  pub fn sync_now(&self) -> JoinHandle<()> {
    let engine = self.clone();
    self
      .tasks
      .spawn_detached("sync", async move { engine.sync_data().await })
  }

  /// Compare the published version with ours in the background.
  pub fn check_updates(&self) -> JoinHandle<()> {
    let engine = self.clone();
    self.tasks.spawn_detached("check_updates", async move {
      if let Err(e) = engine.poll_version().await {
        debug!(error = %e, "update check failed");
      }
      Ok(())
    })
  }

  /// Rebuild lifecycle state from durable storage after a restart.
  ///
  /// A generation whose data store holds a metadata record was active. The
  /// configured version wins; otherwise the most recently installed one.
  pub async fn restore(&self) -> Result<Option<String>> {
    let prefix = &self.config.cache_prefix;
    let mut found: Vec<Metadata> = Vec::new();

    for name in self.storage.cache_names().await? {
      if CacheNames::data_version(prefix, &name).is_none() {
        continue;
      }
      if let Some(metadata) = self.read_metadata(&name).await? {
        found.push(metadata);
      }
    }

    let chosen = found
      .iter()
      .find(|m| m.version == self.config.version)
      .or_else(|| found.iter().max_by_key(|m| m.installed_at));

    let Some(metadata) = chosen else {
      return Ok(None);
    };

    let version = metadata.version.clone();
    info!(version = %version, "restored active generation");
    self
      .dispatch(LifecycleEvent::Restored {
        version: version.clone(),
        names: CacheNames::for_version(prefix, &version),
      })
      .await?;
    Ok(Some(version))
  }

  // ==========================================================================
  // Effect execution
  // ==========================================================================

  /// Apply an event and run its effects until no follow-up events remain.
  async fn dispatch(&self, event: LifecycleEvent) -> Result<()> {
    let mut pending = VecDeque::from([event]);

    while let Some(event) = pending.pop_front() {
      let effects = {
        let mut state = self.lock_state()?;
        let (next, effects) = transition(&state, event)?;
        *state = next;
        effects
      };

      for effect in effects {
        if let Some(follow_up) = self.run_effect(effect).await? {
          pending.push_back(follow_up);
        }
      }
    }
    Ok(())
  }

  async fn run_effect(&self, effect: Effect) -> Result<Option<LifecycleEvent>> {
    match effect {
      Effect::Broadcast(event) => {
        self.broadcast(event);
        Ok(None)
      }
      Effect::Precache { version } => {
        self
          .tasks
          .reinstate(&CacheNames::for_version(&self.config.cache_prefix, &version))
          .await;
        let failed = self.precache(&version).await?;
        Ok(Some(LifecycleEvent::PrecacheFinished { version, failed }))
      }
      Effect::Activate { version, keep } => {
        self.sweep(&version, &keep).await?;
        Ok(Some(LifecycleEvent::ActivationFinished { version }))
      }
      Effect::WriteMetadata { version } => {
        // A missing record only affects restore, not serving
        if let Err(e) = self.write_metadata(&version).await {
          warn!(version = %version, error = %e, "failed to write metadata");
        }
        Ok(None)
      }
    }
  }

  fn broadcast(&self, event: ClientEvent) {
    debug!(event = ?event, "broadcast");
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  /// Fetch the precache list and store it as one batch.
  ///
  /// Returns the URLs that failed; nothing is stored unless all succeed.
  async fn precache(&self, version: &str) -> Result<Vec<String>> {
    if version != self.config.version {
      return Err(EngineError::UnknownGeneration(version.to_string()));
    }
    let names = self.config.cache_names();

    let mut requests = Vec::with_capacity(self.config.precache.len());
    let mut failed = Vec::new();
    for url in &self.config.precache {
      match resolve_key(&self.config, url).and_then(|k| Ok((k.to_request()?, k))) {
        Ok(pair) => requests.push(pair),
        Err(_) => failed.push(url.clone()),
      }
    }

    let responses = join_all(
      requests
        .iter()
        .map(|(request, _)| self.network.fetch(request)),
    )
    .await;

    let mut entries = Vec::with_capacity(requests.len());
    for ((_, key), result) in requests.into_iter().zip(responses) {
      match result {
        Ok(response) if response.is_success() => {
          entries.push((key, StoredResponse::capture(response)));
        }
        Ok(response) => {
          warn!(key = %key, status = response.status, "precache response rejected");
          failed.push(key.url().to_string());
        }
        Err(e) => {
          warn!(key = %key, error = %e, "precache fetch failed");
          failed.push(key.url().to_string());
        }
      }
    }

    if !failed.is_empty() {
      return Ok(failed);
    }

    let count = entries.len();
    if let Err(e) = self.storage.put_all(&names.static_cache, entries).await {
      error!(version = %version, error = %e, "precache write failed");
      return Ok(self.config.precache.clone());
    }
    info!(version = %version, count, "precached");
    Ok(Vec::new())
  }

  /// Delete every store not owned by the activating generation.
  ///
  /// The stores of every other known generation are retired first, so
  /// background writes still aimed at them are dropped instead of recreating
  /// them after the sweep.
  async fn sweep(&self, version: &str, keep: &CacheNames) -> Result<()> {
    info!(version = %version, "activating");

    let superseded: Vec<String> = self
      .lock_state()?
      .generations()
      .iter()
      .filter(|g| g.version != version)
      .flat_map(|g| g.names.all().map(String::from))
      .collect();

    let deleted = self
      .tasks
      .retire(self.storage.as_ref(), keep, &superseded)
      .await?;
    for name in &deleted {
      info!(cache = %name, "deleted old cache");
    }
    Ok(())
  }

  /// Cache names of the generation serving traffic.
  fn serving_names(&self) -> Result<CacheNames> {
    Ok(match self.serving_generation()? {
      Some(generation) => generation.names,
      None => self.config.cache_names(),
    })
  }

  async fn read_metadata(&self, data_cache: &str) -> Result<Option<Metadata>> {
    let Some(stored) = self.storage.get(data_cache, &self.metadata_key).await? else {
      return Ok(None);
    };
    match serde_json::from_slice(&stored.response().body) {
      Ok(metadata) => Ok(Some(metadata)),
      Err(e) => {
        warn!(cache = %data_cache, error = %e, "ignoring corrupt metadata");
        Ok(None)
      }
    }
  }

  async fn put_metadata(&self, data_cache: &str, metadata: &Metadata) -> Result<()> {
    let response = Response::json(200, metadata)?;
    let value = StoredResponse::capture(response);
    if !self
      .tasks
      .put_live(self.storage.as_ref(), data_cache, &self.metadata_key, value)
      .await?
    {
      debug!(cache = %data_cache, "metadata not written to retired store");
    }
    Ok(())
  }

  async fn write_metadata(&self, version: &str) -> Result<()> {
    let names = CacheNames::for_version(&self.config.cache_prefix, version);
    let now = Utc::now();
    self
      .put_metadata(
        &names.data,
        &Metadata {
          version: version.to_string(),
          installed_at: now,
          last_sync: now,
        },
      )
      .await
  }

  /// Refresh `lastSync`, keeping `installedAt`.
  async fn touch_last_sync(&self, generation: &Generation) -> Result<()> {
    let now = Utc::now();
    let metadata = match self.read_metadata(&generation.names.data).await? {
      Some(existing) => Metadata {
        last_sync: now,
        ..existing
      },
      None => Metadata {
        version: generation.version.clone(),
        installed_at: now,
        last_sync: now,
      },
    };
    self.put_metadata(&generation.names.data, &metadata).await
  }

  async fn sync_data(&self) -> Result<()> {
    let Some(generation) = self.current_generation()? else {
      debug!("sync skipped: no active generation");
      return Ok(());
    };
    let data = &generation.names.data;

    let keys: Vec<RequestKey> = self
      .storage
      .keys(data)
      .await?
      .into_iter()
      .filter(|k| *k != self.metadata_key)
      .filter(|k| {
        self
          .config
          .sync_segments
          .iter()
          .any(|seg| k.url().contains(seg.as_str()))
      })
      .collect();

    let mut synced = 0usize;
    for key in &keys {
      let request = match key.to_request() {
        Ok(request) => request,
        Err(e) => {
          warn!(key = %key, error = %e, "sync skipped");
          continue;
        }
      };
      match self.network.fetch(&request).await {
        Ok(response) if response.is_success() => {
          let value = StoredResponse::capture(response);
          match self.tasks.put_live(self.storage.as_ref(), data, key, value).await {
            Ok(true) => synced += 1,
            Ok(false) => {}
            Err(e) => warn!(key = %key, error = %e, "sync write failed"),
          }
        }
        Ok(response) => warn!(key = %key, status = response.status, "sync rejected"),
        Err(e) => warn!(key = %key, error = %e, "sync failed"),
      }
    }

    if synced > 0 {
      if let Err(e) = self.touch_last_sync(&generation).await {
        warn!(error = %e, "failed to record sync time");
      }
    }
    info!(synced, total = keys.len(), "sync complete");

    self.broadcast(ClientEvent::SyncComplete {
      timestamp: Utc::now(),
    });
    Ok(())
  }

  async fn poll_version(&self) -> Result<()> {
    #[derive(Deserialize)]
    struct Published {
      version: String,
    }

    let url = self
      .config
      .resolve(&self.config.version_url)
      .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
    let request = Request::get(url).with_header("cache-control", "no-store");
    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(EngineError::NetworkUnavailable(format!(
        "version check returned {}",
        response.status
      )));
    }

    let published: Published = serde_json::from_slice(&response.body)?;
    let current = self.active_version()?;
    if published.version != current {
      info!(current = %current, available = %published.version, "update available");
      self.broadcast(ClientEvent::UpdateAvailable {
        current_version: current,
        new_version: published.version,
      });
    }
    Ok(())
  }

  async fn passthrough(&self, request: &Request) -> Result<FetchOutcome> {
    debug!(method = %request.method, url = %request.url, "passthrough");
    let response = self.network.fetch(request).await?;
    Ok(FetchOutcome::Passthrough(response))
  }
}

fn resolve_key(config: &EngineConfig, url: &str) -> Result<RequestKey> {
  let url = config
    .resolve(url)
    .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
  Ok(RequestKey::from_url(&url))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::testing::ScriptedNetwork;
  use crate::cache::Method;
  use crate::error::StoreError;
  use async_trait::async_trait;
  use serde_json::json;
  use std::time::Duration;
  use url::Url;

  const ORIGIN: &str = "https://app.test";

  type TestEngine = CacheEngine<MemoryStorage, ScriptedNetwork>;

  fn config(version: &str) -> EngineConfig {
    EngineConfig {
      version: version.to_string(),
      origin: Url::parse(ORIGIN).unwrap(),
      precache: vec!["/".to_string(), "/a.css".to_string()],
      ..EngineConfig::default()
    }
  }

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn get(path: &str) -> Request {
    Request::parse(&url(path)).unwrap()
  }

  fn engine_over(
    version: &str,
    storage: &Arc<MemoryStorage>,
    network: &Arc<ScriptedNetwork>,
  ) -> TestEngine {
    CacheEngine::with_shared(config(version), Arc::clone(storage), Arc::clone(network)).unwrap()
  }

  fn engine(version: &str) -> TestEngine {
    engine_over(
      version,
      &Arc::new(MemoryStorage::new()),
      &Arc::new(ScriptedNetwork::new()),
    )
  }

  fn script_precache(engine: &TestEngine, label: &str) {
    engine
      .network
      .respond(&url("/"), Response::new(200, format!("{} home", label)));
    engine
      .network
      .respond(&url("/a.css"), Response::new(200, format!("{} css", label)));
  }

  async fn installed(version: &str) -> TestEngine {
    let engine = engine(version);
    script_precache(&engine, version);
    assert_eq!(engine.on_install().await.unwrap(), Phase::Active);
    engine
  }

  fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      events.push(event);
    }
    events
  }

  async fn key_urls(engine: &TestEngine, cache: &str) -> Vec<String> {
    engine
      .storage
      .keys(cache)
      .await
      .unwrap()
      .iter()
      .map(|k| k.url().to_string())
      .collect()
  }

  #[tokio::test]
  async fn test_install_precaches_static_store() {
    let engine = engine("1");
    script_precache(&engine, "v1");
    let mut rx = engine.subscribe();

    let phase = engine.on_install().await.unwrap();

    assert_eq!(phase, Phase::Active);
    let names = engine.config().cache_names();
    assert_eq!(
      key_urls(&engine, &names.static_cache).await,
      vec![url("/"), url("/a.css")]
    );
    assert_eq!(
      drain(&mut rx),
      vec![
        ClientEvent::Installing {
          version: "1".to_string()
        },
        ClientEvent::Activated {
          version: "1".to_string()
        },
      ]
    );
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let engine = engine("1");
    engine.network.respond(&url("/"), Response::new(200, "home"));
    engine.network.respond(&url("/a.css"), Response::new(404, "missing"));

    let err = engine.on_install().await.unwrap_err();

    match err {
      EngineError::PrecacheFailure { version, failed } => {
        assert_eq!(version, "1");
        assert_eq!(failed, vec![url("/a.css")]);
      }
      other => panic!("unexpected error: {other}"),
    }
    assert!(engine.storage.cache_names().await.unwrap().is_empty());
    assert!(engine.current_generation().unwrap().is_none());
  }

  #[tokio::test]
  async fn test_image_offline_gets_placeholder() {
    let engine = installed("1").await;
    engine.network.clear();

    let outcome = engine.on_fetch(&get("/photo.png")).await.unwrap();

    assert_eq!(outcome.source(), Some(Source::Fallback));
    let response = outcome.response();
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("image/svg+xml"));
    assert!(String::from_utf8_lossy(&response.body).contains("<svg"));
  }

  #[tokio::test]
  async fn test_api_offline_gets_payload() {
    let engine = installed("1").await;
    engine.network.clear();

    let outcome = engine.on_fetch(&get("/api/users")).await.unwrap();

    let body: serde_json::Value = serde_json::from_slice(&outcome.response().body).unwrap();
    assert_eq!(body["offline"], json!(true));
    assert!(body["timestamp"].is_string());
  }

  #[tokio::test]
  async fn test_skip_waiting_cuts_over_to_new_generation() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::new());

    let v1 = engine_over("1", &storage, &network);
    script_precache(&v1, "v1");
    v1.on_install().await.unwrap();
    // Populate the runtime store as well
    v1.on_fetch(&Request::navigate(Url::parse(&url("/")).unwrap()))
      .await
      .unwrap();
    v1.tasks().wait_idle().await;
    let old = v1.config().cache_names();
    assert_eq!(storage.cache_names().await.unwrap().len(), 3);

    // Restart with the next release
    let v2 = engine_over("2", &storage, &network);
    assert_eq!(v2.restore().await.unwrap(), Some("1".to_string()));
    let mut rx = v2.subscribe();
    script_precache(&v2, "v2");

    assert_eq!(v2.on_install().await.unwrap(), Phase::Waiting);
    assert_eq!(v2.current_generation().unwrap().unwrap().version, "1");
    assert!(drain(&mut rx).contains(&ClientEvent::UpdateAvailable {
      current_version: "1".to_string(),
      new_version: "2".to_string(),
    }));

    let reply = v2.on_message(ControlMessage::SkipWaiting).await.unwrap();
    assert!(reply.is_none());
    assert_eq!(v2.current_generation().unwrap().unwrap().version, "2");

    let remaining = storage.cache_names().await.unwrap();
    for name in old.all() {
      assert!(!remaining.iter().any(|n| n == name), "{name} survived");
    }

    network.clear();
    let outcome = v2.on_fetch(&get("/")).await.unwrap();
    assert_eq!(outcome.source(), Some(Source::Cache));
    assert_eq!(outcome.response().body, b"v2 home".to_vec());
  }

  #[tokio::test]
  async fn test_passthrough_requests_are_not_stored() {
    let engine = installed("1").await;
    let post_url = url("/api/users");
    engine.network.respond(&post_url, Response::new(201, "created"));
    engine
      .network
      .respond("https://elsewhere.test/x.js", Response::new(200, "x"));

    let post = get("/api/users").with_method(Method::Post);
    let outcome = engine.on_fetch(&post).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Passthrough(_)));
    assert_eq!(outcome.response().status, 201);

    let foreign = Request::parse("https://elsewhere.test/x.js").unwrap();
    let outcome = engine.on_fetch(&foreign).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Passthrough(_)));

    engine.tasks().wait_idle().await;
    let names = engine.config().cache_names();
    assert!(key_urls(&engine, &names.data).await.iter().all(|u| u != &post_url));
    assert!(key_urls(&engine, &names.runtime).await.is_empty());
  }

  #[tokio::test]
  async fn test_no_active_generation_passes_through() {
    let engine = engine("1");
    engine.network.respond(&url("/a.css"), Response::new(200, "css"));

    let outcome = engine.on_fetch(&get("/a.css")).await.unwrap();

    assert!(matches!(outcome, FetchOutcome::Passthrough(_)));
    assert!(engine.storage.cache_names().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_clear_all_is_idempotent() {
    let engine = installed("1").await;
    let mut rx = engine.subscribe();

    engine.on_message(ControlMessage::ClearCache).await.unwrap();
    assert!(engine.storage.cache_names().await.unwrap().is_empty());

    engine.clear_all().await.unwrap();
    assert!(engine.storage.cache_names().await.unwrap().is_empty());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(events
      .iter()
      .all(|e| matches!(e, ClientEvent::CacheCleared { .. })));
  }

  #[tokio::test]
  async fn test_ping_and_version_replies() {
    let engine = installed("1").await;

    match engine.on_message(ControlMessage::Ping).await.unwrap() {
      Some(Reply::Pong(pong)) => {
        assert!(pong.pong);
        assert_eq!(pong.version, "1");
      }
      other => panic!("unexpected reply: {other:?}"),
    }

    match engine.on_message(ControlMessage::GetVersion).await.unwrap() {
      Some(Reply::Version(info)) => {
        assert_eq!(info.version, "1");
        assert_eq!(
          info.cache_names,
          vec!["app-static-v1", "app-runtime-v1", "app-data-v1"]
        );
      }
      other => panic!("unexpected reply: {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_cache_info_lists_stores() {
    let engine = installed("1").await;

    let reply = engine.on_message(ControlMessage::GetCacheInfo).await.unwrap();

    let info = match reply {
      Some(Reply::CacheInfo(info)) => info,
      other => panic!("unexpected reply: {other:?}"),
    };
    assert_eq!(info.total_caches, 2);
    let static_info = &info.cache_info["app-static-v1"];
    assert_eq!(static_info.size, 2);
    assert_eq!(static_info.urls, vec![url("/"), url("/a.css")]);
    assert_eq!(info.cache_info["app-data-v1"].size, 1);
  }

  #[tokio::test]
  async fn test_update_cache_serves_offline() {
    let engine = installed("1").await;
    engine.network.clear();

    engine
      .on_message(ControlMessage::UpdateCache(UpdateCache {
        url: "/api/settings".to_string(),
        content: json!({"theme": "dark"}),
      }))
      .await
      .unwrap();

    let outcome = engine.on_fetch(&get("/api/settings")).await.unwrap();
    assert_eq!(outcome.source(), Some(Source::Cache));
    let body: serde_json::Value = serde_json::from_slice(&outcome.response().body).unwrap();
    assert_eq!(body, json!({"theme": "dark"}));
  }

  #[tokio::test]
  async fn test_api_success_refreshes_last_sync() {
    let engine = installed("1").await;
    let data = engine.config().cache_names().data;
    let before = engine.read_metadata(&data).await.unwrap().unwrap();

    engine
      .network
      .respond(&url("/api/users"), Response::new(200, "[]"));
    engine.on_fetch(&get("/api/users")).await.unwrap();
    engine.tasks().wait_idle().await;

    let after = engine.read_metadata(&data).await.unwrap().unwrap();
    assert_eq!(after.version, "1");
    assert_eq!(after.installed_at, before.installed_at);
    assert!(after.last_sync >= before.last_sync);
  }

  #[tokio::test]
  async fn test_sync_now_refreshes_data_entries() {
    let engine = installed("1").await;
    let data = engine.config().cache_names().data;
    engine
      .network
      .respond(&url("/api/items"), Response::new(200, "old"));
    engine.on_fetch(&get("/api/items")).await.unwrap();
    engine.tasks().wait_idle().await;

    engine
      .network
      .respond(&url("/api/items"), Response::new(200, "new"));
    let mut rx = engine.subscribe();
    engine.on_message(ControlMessage::SyncNow).await.unwrap();
    engine.tasks().wait_idle().await;

    let key = get("/api/items").key().unwrap();
    let stored = engine.storage.get(&data, &key).await.unwrap().unwrap();
    assert_eq!(stored.response().body, b"new".to_vec());
    assert!(drain(&mut rx)
      .iter()
      .any(|e| matches!(e, ClientEvent::SyncComplete { .. })));
  }

  #[tokio::test]
  async fn test_check_updates_announces_new_version() {
    let engine = installed("1").await;
    let mut rx = engine.subscribe();

    engine
      .network
      .respond(&url("/version.json"), Response::new(200, r#"{"version":"1"}"#));
    engine.check_updates().await.unwrap();
    assert!(drain(&mut rx).is_empty());

    engine
      .network
      .respond(&url("/version.json"), Response::new(200, r#"{"version":"2"}"#));
    engine.check_updates().await.unwrap();
    assert_eq!(
      drain(&mut rx),
      vec![ClientEvent::UpdateAvailable {
        current_version: "1".to_string(),
        new_version: "2".to_string(),
      }]
    );
  }

  #[tokio::test]
  async fn test_restore_prefers_configured_version() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::new());
    let v1 = engine_over("1", &storage, &network);
    script_precache(&v1, "v1");
    v1.on_install().await.unwrap();

    let restarted = engine_over("1", &storage, &network);
    assert_eq!(restarted.restore().await.unwrap(), Some("1".to_string()));
    assert_eq!(restarted.current_generation().unwrap().unwrap().phase, Phase::Active);

    // Re-running install for the restored version changes nothing
    assert_eq!(restarted.on_install().await.unwrap(), Phase::Active);
  }

  #[tokio::test]
  async fn test_restore_with_empty_storage() {
    let engine = engine("1");
    assert_eq!(engine.restore().await.unwrap(), None);
    assert!(engine.current_generation().unwrap().is_none());
  }

  /// Memory storage with slow store deletion and an injectable write failure.
  #[derive(Default)]
  struct FlakyStorage {
    inner: MemoryStorage,
    delete_delay: Option<Duration>,
    failing_url: Mutex<Option<String>>,
  }

  #[async_trait]
  impl CacheStorage for FlakyStorage {
    async fn get(
      &self,
      cache: &str,
      key: &RequestKey,
    ) -> std::result::Result<Option<StoredResponse>, StoreError> {
      self.inner.get(cache, key).await
    }

    async fn put(
      &self,
      cache: &str,
      key: &RequestKey,
      value: StoredResponse,
    ) -> std::result::Result<(), StoreError> {
      if self.failing_url.lock().unwrap().as_deref() == Some(key.url()) {
        return Err(StoreError("disk full".to_string()));
      }
      self.inner.put(cache, key, value).await
    }

    async fn put_all(
      &self,
      cache: &str,
      entries: Vec<(RequestKey, StoredResponse)>,
    ) -> std::result::Result<(), StoreError> {
      self.inner.put_all(cache, entries).await
    }

    async fn delete(&self, cache: &str, key: &RequestKey) -> std::result::Result<bool, StoreError> {
      self.inner.delete(cache, key).await
    }

    async fn keys(&self, cache: &str) -> std::result::Result<Vec<RequestKey>, StoreError> {
      self.inner.keys(cache).await
    }

    async fn cache_names(&self) -> std::result::Result<Vec<String>, StoreError> {
      self.inner.cache_names().await
    }

    async fn delete_cache(&self, cache: &str) -> std::result::Result<bool, StoreError> {
      if let Some(delay) = self.delete_delay {
        tokio::time::sleep(delay).await;
      }
      self.inner.delete_cache(cache).await
    }
  }

  fn respond_precache(network: &ScriptedNetwork, label: &str) {
    network.respond(&url("/"), Response::new(200, format!("{} home", label)));
    network.respond(&url("/a.css"), Response::new(200, format!("{} css", label)));
  }

  #[tokio::test]
  async fn test_metadata_record_is_not_served_or_overwritten() {
    let engine = installed("1").await;
    engine
      .network
      .respond(&url("/metadata.json"), Response::new(200, "public"));

    let outcome = engine.on_fetch(&get("/metadata.json")).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Passthrough(_)));
    assert_eq!(outcome.response().body, b"public".to_vec());

    engine.tasks().wait_idle().await;
    let data = engine.config().cache_names().data;
    let metadata = engine.read_metadata(&data).await.unwrap().unwrap();
    assert_eq!(metadata.version, "1");

    let restarted = engine_over("1", engine.storage(), &engine.network);
    assert_eq!(restarted.restore().await.unwrap(), Some("1".to_string()));
  }

  #[tokio::test]
  async fn test_revalidation_started_before_cutover_is_dropped() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(ScriptedNetwork::new());

    let v1 = engine_over("1", &storage, &network);
    script_precache(&v1, "v1");
    v1.on_install().await.unwrap();

    let v2 = engine_over("2", &storage, &network);
    v2.restore().await.unwrap();
    script_precache(&v2, "v2");
    assert_eq!(v2.on_install().await.unwrap(), Phase::Waiting);

    // Served from v1 while it is still active; the refresh lands late
    network.respond_after(
      &url("/a.css"),
      Duration::from_millis(200),
      Response::new(200, "late"),
    );
    let outcome = v2.on_fetch(&get("/a.css")).await.unwrap();
    assert_eq!(outcome.response().body, b"v1 css".to_vec());

    v2.on_message(ControlMessage::SkipWaiting).await.unwrap();
    v2.tasks().wait_idle().await;

    assert_eq!(
      storage.cache_names().await.unwrap(),
      vec!["app-data-v2".to_string(), "app-static-v2".to_string()]
    );
  }

  #[tokio::test]
  async fn test_requests_during_activation_use_new_generation() {
    let storage = Arc::new(FlakyStorage {
      delete_delay: Some(Duration::from_millis(50)),
      ..FlakyStorage::default()
    });
    let network = Arc::new(ScriptedNetwork::new());

    let v1 = CacheEngine::with_shared(config("1"), Arc::clone(&storage), Arc::clone(&network))
      .unwrap();
    respond_precache(&network, "v1");
    v1.on_install().await.unwrap();

    let v2 = CacheEngine::with_shared(config("2"), Arc::clone(&storage), Arc::clone(&network))
      .unwrap();
    v2.restore().await.unwrap();
    respond_precache(&network, "v2");
    assert_eq!(v2.on_install().await.unwrap(), Phase::Waiting);

    let activation = tokio::spawn({
      let v2 = v2.clone();
      async move { v2.on_message(ControlMessage::SkipWaiting).await }
    });
    while v2.state().unwrap().generation("2").map(|g| g.phase) != Some(Phase::Activating) {
      tokio::task::yield_now().await;
    }

    // Mid-sweep: the new generation answers and its refresh waits for the sweep
    network.respond_after(
      &url("/a.css"),
      Duration::from_millis(10),
      Response::new(200, "v2 fresh"),
    );
    let outcome = v2.on_fetch(&get("/a.css")).await.unwrap();
    assert_eq!(outcome.source(), Some(Source::Cache));
    assert_eq!(outcome.response().body, b"v2 css".to_vec());

    activation.await.unwrap().unwrap();
    v2.tasks().wait_idle().await;
    assert_eq!(v2.current_generation().unwrap().unwrap().version, "2");

    let remaining = storage.cache_names().await.unwrap();
    assert!(remaining.iter().all(|name| name.ends_with("-v2")), "{remaining:?}");
    let key = get("/a.css").key().unwrap();
    let refreshed = storage.get("app-static-v2", &key).await.unwrap().unwrap();
    assert_eq!(refreshed.response().body, b"v2 fresh".to_vec());
  }

  #[tokio::test]
  async fn test_sync_continues_past_failed_write() {
    let storage = Arc::new(FlakyStorage::default());
    let network = Arc::new(ScriptedNetwork::new());
    let engine =
      CacheEngine::with_shared(config("1"), Arc::clone(&storage), Arc::clone(&network)).unwrap();
    respond_precache(&network, "v1");
    engine.on_install().await.unwrap();

    let data = engine.config().cache_names().data;
    for path in ["/api/a", "/api/b"] {
      storage
        .inner
        .put(
          &data,
          &get(path).key().unwrap(),
          StoredResponse::capture(Response::new(200, "old")),
        )
        .await
        .unwrap();
      network.respond(&url(path), Response::new(200, "new"));
    }
    *storage.failing_url.lock().unwrap() = Some(url("/api/a"));

    let mut rx = engine.subscribe();
    engine.sync_now().await.unwrap();

    let body = |path: &'static str| {
      let storage = Arc::clone(&storage);
      let data = data.clone();
      async move {
        let key = get(path).key().unwrap();
        storage.get(&data, &key).await.unwrap().unwrap().response().body.clone()
      }
    };
    assert_eq!(body("/api/a").await, b"old".to_vec());
    assert_eq!(body("/api/b").await, b"new".to_vec());
    assert!(drain(&mut rx)
      .iter()
      .any(|e| matches!(e, ClientEvent::SyncComplete { .. })));
  }
}
