//! Scripted network double for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::request::{Request, Response};
use super::traits::Network;
use crate::error::NetworkError;

#[derive(Clone)]
struct Script {
  delay: Option<Duration>,
  response: Response,
}

/// Answers only the URLs it was told about; everything else is a connection error.
#[derive(Default)]
pub struct ScriptedNetwork {
  scripts: Mutex<HashMap<String, Script>>,
  calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.scripts.lock().unwrap().insert(
      url.to_string(),
      Script {
        delay: None,
        response,
      },
    );
  }

  pub fn respond_after(&self, url: &str, delay: Duration, response: Response) {
    self.scripts.lock().unwrap().insert(
      url.to_string(),
      Script {
        delay: Some(delay),
        response,
      },
    );
  }

  /// Take the network down for every URL.
  pub fn clear(&self) {
    self.scripts.lock().unwrap().clear();
  }

  pub fn calls(&self, url: &str) -> usize {
    self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let url = request.url.to_string();
    *self.calls.lock().unwrap().entry(url.clone()).or_default() += 1;

    let script = self.scripts.lock().unwrap().get(&url).cloned();
    match script {
      Some(script) => {
        if let Some(delay) = script.delay {
          tokio::time::sleep(delay).await;
        }
        Ok(script.response)
      }
      None => Err(NetworkError::Connection(format!("{} unreachable", url))),
    }
  }
}
