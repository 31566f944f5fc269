//! Request classification.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use url::Url;

use super::request::Request;
use crate::config::EngineConfig;

/// Closed set of resource classes, each mapped to one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
  Navigation,
  Image,
  Static,
  ApiData,
  Default,
}

impl fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ResourceClass::Navigation => "navigation",
      ResourceClass::Image => "image",
      ResourceClass::Static => "static",
      ResourceClass::ApiData => "api_data",
      ResourceClass::Default => "default",
    };
    f.write_str(name)
  }
}

/// Maps requests to resource classes. First match wins:
/// navigation flag, image extension, static extension, API path segment.
#[derive(Debug, Clone)]
pub struct Classifier {
  image_extensions: BTreeSet<String>,
  static_extensions: BTreeSet<String>,
  api_segments: Vec<String>,
}

impl Classifier {
  pub fn new(config: &EngineConfig) -> Self {
    Self {
      image_extensions: config.image_extensions.clone(),
      static_extensions: config.static_extensions.clone(),
      api_segments: config.api_segments.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> ResourceClass {
    if request.navigate {
      return ResourceClass::Navigation;
    }

    let path = request.url.path();
    if let Some(ext) = extension(path) {
      if self.image_extensions.contains(&ext) {
        return ResourceClass::Image;
      }
      if self.static_extensions.contains(&ext) {
        return ResourceClass::Static;
      }
    }

    if self.api_segments.iter().any(|seg| path.contains(seg.as_str())) {
      return ResourceClass::ApiData;
    }

    ResourceClass::Default
  }
}

/// Lowercased extension of the last path segment, if any.
fn extension(path: &str) -> Option<String> {
  let file = path.rsplit('/').next()?;
  let (_, ext) = file.rsplit_once('.')?;
  (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

/// Whether the engine handles a URL at all: same origin, or an allowed host.
pub fn in_scope(url: &Url, origin: &Url, allowed_hosts: &[String]) -> bool {
  if url.origin() == origin.origin() {
    return true;
  }
  url
    .host_str()
    .map(|host| allowed_hosts.iter().any(|allowed| allowed.eq_ignore_ascii_case(host)))
    .unwrap_or(false)
}
