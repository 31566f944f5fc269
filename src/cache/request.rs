//! Request and response values that flow through the engine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::EngineError;

/// HTTP method of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
  Other(String),
}

impl Method {
  pub fn as_str(&self) -> &str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
      Method::Other(m) => m,
    }
  }
}

impl FromStr for Method {
  type Err = std::convert::Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let upper = s.trim().to_ascii_uppercase();
    Ok(match upper.as_str() {
      "GET" => Method::Get,
      "HEAD" => Method::Head,
      "POST" => Method::Post,
      "PUT" => Method::Put,
      "PATCH" => Method::Patch,
      "DELETE" => Method::Delete,
      "OPTIONS" => Method::Options,
      _ => Method::Other(upper),
    })
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// An inbound request as seen by the engine.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Set by the host when the request is a top-level page navigation
  pub navigate: bool,
  pub headers: BTreeMap<String, String>,
}

impl Request {
  /// Create a GET request for the given absolute URL.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      navigate: false,
      headers: BTreeMap::new(),
    }
  }

  /// Create a GET navigation request.
  pub fn navigate(url: Url) -> Self {
    Self {
      navigate: true,
      ..Self::get(url)
    }
  }

  /// Parse an absolute URL and create a GET request for it.
  pub fn parse(url: &str) -> Result<Self, EngineError> {
    let url = Url::parse(url).map_err(|e| EngineError::InvalidRequest(format!("{}: {}", url, e)))?;
    Ok(Self::get(url))
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::Get
  }

  /// Cache key for this request. Only GET requests have one.
  pub fn key(&self) -> Option<RequestKey> {
    if self.is_get() {
      Some(RequestKey::from_url(&self.url))
    } else {
      None
    }
  }
}

/// Identity of a stored entry: method plus normalized absolute URL.
///
/// The query string is significant; the fragment is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
  url: String,
}

impl RequestKey {
  /// The only method that is ever stored.
  pub const METHOD: &'static str = "GET";

  pub fn from_url(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self { url: url.into() }
  }

  /// Rebuild a key from the URL text persisted by a storage backend.
  pub fn from_stored(url: &str) -> Result<Self, EngineError> {
    let url = Url::parse(url).map_err(|e| EngineError::InvalidRequest(format!("{}: {}", url, e)))?;
    Ok(Self::from_url(&url))
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Build the request this key was derived from.
  pub fn to_request(&self) -> Result<Request, EngineError> {
    Request::parse(&self.url)
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", Self::METHOD, self.url)
  }
}

/// A response produced by the network, the store, or a synthesized fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  /// Header names are lowercase
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// JSON response with the matching content type.
  pub fn json<T: Serialize>(status: u16, value: &T) -> Result<Self, EngineError> {
    let body = serde_json::to_vec(value)?;
    Ok(Self::new(status, body).with_header("content-type", "application/json"))
  }

  /// True for a 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }
}

/// An immutable snapshot of a response held by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  response: Response,
  stored_at: DateTime<Utc>,
}

impl StoredResponse {
  /// Snapshot a response now.
  pub fn capture(response: Response) -> Self {
    Self::restore(response, Utc::now())
  }

  /// Rebuild a snapshot read back from durable storage.
  pub fn restore(response: Response, stored_at: DateTime<Utc>) -> Self {
    Self {
      response,
      stored_at,
    }
  }

  pub fn response(&self) -> &Response {
    &self.response
  }

  pub fn stored_at(&self) -> DateTime<Utc> {
    self.stored_at
  }

  pub fn into_response(self) -> Response {
    self.response
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_ignores_fragment_but_keeps_query() {
    let a = Request::parse("https://app.test/list?page=2#top").unwrap();
    let b = Request::parse("https://app.test/list?page=2").unwrap();
    let c = Request::parse("https://app.test/list?page=3").unwrap();

    assert_eq!(a.key(), b.key());
    assert_ne!(a.key(), c.key());
  }

  #[test]
  fn test_non_get_has_no_key() {
    let req = Request::parse("https://app.test/api/items")
      .unwrap()
      .with_method(Method::Post);
    assert!(req.key().is_none());
  }

  #[test]
  fn test_method_parse() {
    assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
    assert_eq!(
      "purge".parse::<Method>().unwrap(),
      Method::Other("PURGE".to_string())
    );
  }

  #[test]
  fn test_response_success_range() {
    assert!(Response::new(200, "").is_success());
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(304, "").is_success());
    assert!(!Response::new(503, "").is_success());
  }

  #[test]
  fn test_headers_are_case_insensitive() {
    let resp = Response::new(200, "").with_header("Content-Type", "text/css");
    assert_eq!(resp.header("CONTENT-TYPE"), Some("text/css"));
  }

  #[test]
  fn test_key_display() {
    let key = Request::parse("https://app.test/a.css").unwrap().key().unwrap();
    assert_eq!(key.to_string(), "GET https://app.test/a.css");
  }
}
