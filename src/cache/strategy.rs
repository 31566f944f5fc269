//! Caching strategies and the class-to-strategy table.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::classify::ResourceClass;
use super::request::{Request, RequestKey, Response, StoredResponse};
use super::revalidate::{revalidate, write_back, BackgroundTasks};
use super::traits::{CacheStorage, Network};
use super::{CacheNames, Namespace};
use crate::error::EngineError;

/// Inline image served when an image is neither cached nor reachable.
pub const PLACEHOLDER_SVG: &str = concat!(
  r#"<svg xmlns="http://www.w3.org/2000/svg" width="100" height="100" viewBox="0 0 100 100">"#,
  r##"<rect width="100" height="100" fill="#f0f9ff"/>"##,
  r##"<text x="50" y="55" text-anchor="middle" fill="#1A5F7A" font-family="Arial" font-size="12">Image</text>"##,
  "</svg>"
);

/// What a network-first strategy does when both network and cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
  /// Serve the configured offline document
  OfflineDocument,
  /// Synthesize a JSON body with `offline: true`
  OfflinePayload,
  /// Hand the failure back to the caller
  Propagate,
}

/// How a cache lookup and a network fetch combine into one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NetworkFirst { fallback: Fallback },
  /// Serve hits immediately, optionally refreshing them in the background
  CacheFirst { revalidate: bool },
  CacheFirstWithPlaceholder,
}

/// A strategy plus the namespace it writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
  pub strategy: Strategy,
  pub namespace: Namespace,
}

/// Class-to-strategy mapping.
#[derive(Debug, Clone)]
pub struct StrategyTable {
  routes: HashMap<ResourceClass, Route>,
}

fn route(strategy: Strategy, namespace: Namespace) -> Route {
  Route {
    strategy,
    namespace,
  }
}

impl Default for StrategyTable {
  fn default() -> Self {
    let routes = HashMap::from([
      (
        ResourceClass::Navigation,
        route(
          Strategy::NetworkFirst {
            fallback: Fallback::OfflineDocument,
          },
          Namespace::Runtime,
        ),
      ),
      (
        ResourceClass::Image,
        route(Strategy::CacheFirstWithPlaceholder, Namespace::Runtime),
      ),
      (
        ResourceClass::Static,
        route(Strategy::CacheFirst { revalidate: true }, Namespace::Static),
      ),
      (
        ResourceClass::ApiData,
        route(
          Strategy::NetworkFirst {
            fallback: Fallback::OfflinePayload,
          },
          Namespace::Data,
        ),
      ),
      (
        ResourceClass::Default,
        route(
          Strategy::NetworkFirst {
            fallback: Fallback::Propagate,
          },
          Namespace::Runtime,
        ),
      ),
    ]);

    Self { routes }
  }
}

impl StrategyTable {
  pub fn route(&self, class: ResourceClass) -> Route {
    self.routes.get(&class).copied().unwrap_or(route(
      Strategy::NetworkFirst {
        fallback: Fallback::Propagate,
      },
      Namespace::Runtime,
    ))
  }

  /// Replace the route for one class.
  pub fn with_route(mut self, class: ResourceClass, route: Route) -> Self {
    self.routes.insert(class, route);
    self
  }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
  Network,
  Cache,
  /// Offline document, offline payload or placeholder
  Fallback,
}

/// The single response produced for a request.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: Source,
}

impl Served {
  fn new(response: Response, source: Source) -> Self {
    Self { response, source }
  }
}

/// Capabilities and store names a strategy runs against.
pub struct ServeContext<'a, S: CacheStorage, N: Network> {
  pub storage: &'a Arc<S>,
  pub network: &'a Arc<N>,
  pub tasks: &'a BackgroundTasks,
  pub names: &'a CacheNames,
  pub offline_document: &'a RequestKey,
}

impl<S: CacheStorage, N: Network> ServeContext<'_, S, N> {
  /// Look a key up, preferring the route's own namespace.
  async fn lookup(
    &self,
    namespace: Namespace,
    key: &RequestKey,
  ) -> Result<Option<(String, StoredResponse)>, EngineError> {
    let preferred = self.names.get(namespace);
    let order = std::iter::once(preferred).chain(
      self
        .names
        .all()
        .into_iter()
        .filter(move |name| *name != preferred),
    );

    for cache in order {
      if let Some(hit) = self.storage.get(cache, key).await? {
        return Ok(Some((cache.to_string(), hit)));
      }
    }
    Ok(None)
  }
}

impl Strategy {
  /// Produce exactly one response for `request`.
  pub async fn serve<S: CacheStorage, N: Network>(
    &self,
    request: &Request,
    key: &RequestKey,
    namespace: Namespace,
    ctx: &ServeContext<'_, S, N>,
  ) -> Result<Served, EngineError> {
    match *self {
      Strategy::NetworkFirst { fallback } => {
        network_first(request, key, namespace, fallback, ctx).await
      }
      Strategy::CacheFirst { revalidate } => {
        cache_first(request, key, namespace, revalidate, ctx).await
      }
      Strategy::CacheFirstWithPlaceholder => {
        cache_first_with_placeholder(request, key, namespace, ctx).await
      }
    }
  }
}

async fn network_first<S: CacheStorage, N: Network>(
  request: &Request,
  key: &RequestKey,
  namespace: Namespace,
  fallback: Fallback,
  ctx: &ServeContext<'_, S, N>,
) -> Result<Served, EngineError> {
  let error = match ctx.network.fetch(request).await {
    Ok(response) => {
      if response.is_success() {
        write_back(ctx.tasks, ctx.storage, ctx.names.get(namespace), key, &response).await;
      }
      return Ok(Served::new(response, Source::Network));
    }
    Err(e) => e,
  };

  debug!(key = %key, error = %error, "network failed, trying cache");

  let cached = match ctx.lookup(namespace, key).await {
    Ok(hit) => hit,
    // API callers always get the structured offline body
    Err(e) if fallback == Fallback::OfflinePayload => {
      warn!(key = %key, error = %e, "cache lookup failed");
      None
    }
    Err(e) => return Err(e),
  };
  if let Some((_, hit)) = cached {
    return Ok(Served::new(hit.into_response(), Source::Cache));
  }

  match fallback {
    Fallback::OfflineDocument => {
      match ctx.lookup(Namespace::Static, ctx.offline_document).await? {
        Some((_, doc)) => Ok(Served::new(doc.into_response(), Source::Fallback)),
        None => Err(EngineError::NoFallbackAvailable {
          url: key.url().to_string(),
          reason: format!("{}; offline document is not cached", error),
        }),
      }
    }
    Fallback::OfflinePayload => Ok(Served::new(offline_payload()?, Source::Fallback)),
    Fallback::Propagate => Err(EngineError::NoFallbackAvailable {
      url: key.url().to_string(),
      reason: error.to_string(),
    }),
  }
}

async fn cache_first<S: CacheStorage, N: Network>(
  request: &Request,
  key: &RequestKey,
  namespace: Namespace,
  refresh: bool,
  ctx: &ServeContext<'_, S, N>,
) -> Result<Served, EngineError> {
  if let Some((cache, hit)) = ctx.lookup(namespace, key).await? {
    if refresh {
      // Detached: the hit is returned without waiting on the network
      revalidate(ctx.tasks, ctx.storage, ctx.network, &cache, request.clone());
    }
    return Ok(Served::new(hit.into_response(), Source::Cache));
  }

  match ctx.network.fetch(request).await {
    Ok(response) => {
      if response.is_success() {
        write_back(ctx.tasks, ctx.storage, ctx.names.get(namespace), key, &response).await;
      }
      Ok(Served::new(response, Source::Network))
    }
    Err(e) => Err(EngineError::NoFallbackAvailable {
      url: key.url().to_string(),
      reason: e.to_string(),
    }),
  }
}

async fn cache_first_with_placeholder<S: CacheStorage, N: Network>(
  request: &Request,
  key: &RequestKey,
  namespace: Namespace,
  ctx: &ServeContext<'_, S, N>,
) -> Result<Served, EngineError> {
  match ctx.lookup(namespace, key).await {
    Ok(Some((_, hit))) => return Ok(Served::new(hit.into_response(), Source::Cache)),
    Ok(None) => {}
    Err(e) => warn!(key = %key, error = %e, "cache lookup failed"),
  }

  match ctx.network.fetch(request).await {
    Ok(response) => {
      if response.is_success() {
        write_back(ctx.tasks, ctx.storage, ctx.names.get(namespace), key, &response).await;
      }
      Ok(Served::new(response, Source::Network))
    }
    Err(e) => {
      debug!(key = %key, error = %e, "serving placeholder image");
      Ok(Served::new(placeholder_image(), Source::Fallback))
    }
  }
}

/// Placeholder image response.
pub fn placeholder_image() -> Response {
  Response::new(200, PLACEHOLDER_SVG).with_header("content-type", "image/svg+xml")
}

/// Structured body returned to API callers while offline.
pub fn offline_payload() -> Result<Response, EngineError> {
  Response::json(
    503,
    &json!({
      "error": "Network unavailable",
      "offline": true,
      "timestamp": Utc::now().to_rfc3339(),
    }),
  )
}
