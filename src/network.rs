//! HTTP implementation of the network capability.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cache::{Network, Request, Response};
use crate::error::NetworkError;

/// Network backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("swcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| NetworkError::Connection(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| NetworkError::Connection(format!("Invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    let response = builder.send().await.map_err(map_error)?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(map_error)?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

fn map_error(err: reqwest::Error) -> NetworkError {
  if err.is_timeout() {
    NetworkError::Timeout(err.to_string())
  } else {
    NetworkError::Connection(err.to_string())
  }
}
