//! HTTP seam used by the offline layer.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  #[default]
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl HttpMethod {
  /// Whether the method changes server state and must be queued when it
  /// cannot be delivered.
  pub fn is_mutating(self) -> bool {
    matches!(
      self,
      HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Head => "HEAD",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Patch => "PATCH",
      HttpMethod::Delete => "DELETE",
    }
  }
}

impl fmt::Display for HttpMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for HttpMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(HttpMethod::Get),
      "HEAD" => Ok(HttpMethod::Head),
      "POST" => Ok(HttpMethod::Post),
      "PUT" => Ok(HttpMethod::Put),
      "PATCH" => Ok(HttpMethod::Patch),
      "DELETE" => Ok(HttpMethod::Delete),
      other => Err(format!("unsupported HTTP method '{}'", other)),
    }
  }
}

impl From<HttpMethod> for reqwest::Method {
  fn from(method: HttpMethod) -> Self {
    match method {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Head => reqwest::Method::HEAD,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Patch => reqwest::Method::PATCH,
      HttpMethod::Delete => reqwest::Method::DELETE,
    }
  }
}

/// Caller-side request options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
  pub method: HttpMethod,
  /// JSON body
  pub body: Option<Value>,
  pub headers: Vec<(String, String)>,
}

impl RequestOptions {
  pub fn get() -> Self {
    Self::default()
  }

  pub fn post(body: Value) -> Self {
    Self::with_body(HttpMethod::Post, body)
  }

  pub fn put(body: Value) -> Self {
    Self::with_body(HttpMethod::Put, body)
  }

  pub fn delete() -> Self {
    Self {
      method: HttpMethod::Delete,
      ..Self::default()
    }
  }

  pub fn with_body(method: HttpMethod, body: Value) -> Self {
    Self {
      method,
      body: Some(body),
      headers: Vec::new(),
    }
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn to_request(&self, url: &str) -> OutboundRequest {
    OutboundRequest {
      url: url.to_string(),
      method: self.method,
      body: self.body.clone(),
      headers: self.headers.clone(),
    }
  }
}

/// A fully described request handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
  /// Absolute, or relative to the transport's base URL
  pub url: String,
  pub method: HttpMethod,
  pub body: Option<Value>,
  pub headers: Vec<(String, String)>,
}

/// Network access used by the offline layer.
///
/// `send` succeeds only for a 2xx response and yields the parsed JSON body
/// (`Value::Null` when the body is empty). Timeouts, connection failures and
/// non-2xx statuses are errors.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &OutboundRequest) -> Result<Value>;

  /// Lightweight liveness check against `url`.
  async fn probe(&self, url: &str) -> bool;
}

/// [`Transport`] over reqwest.
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid base URL '{}': {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  fn resolve(&self, url: &str) -> Result<Url> {
    self
      .base_url
      .join(url)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &OutboundRequest) -> Result<Value> {
    let url = self.resolve(&request.url)?;

    let mut builder = self
      .client
      .request(request.method.into(), url.clone())
      .header(reqwest::header::CONTENT_TYPE, "application/json");
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("{} {} failed: {}", request.method, url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("HTTP {} for {} {}", status, request.method, url));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes).map_err(|e| eyre!("Invalid JSON from {}: {}", url, e))
  }

  async fn probe(&self, url: &str) -> bool {
    let Ok(url) = self.resolve(url) else {
      return false;
    };

    match self
      .client
      .head(url)
      .header(reqwest::header::CACHE_CONTROL, "no-cache")
      .send()
      .await
    {
      Ok(response) => response.status().is_success(),
      Err(_) => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_mutating_methods() {
    assert!(!HttpMethod::Get.is_mutating());
    assert!(!HttpMethod::Head.is_mutating());
    assert!(HttpMethod::Post.is_mutating());
    assert!(HttpMethod::Put.is_mutating());
    assert!(HttpMethod::Patch.is_mutating());
    assert!(HttpMethod::Delete.is_mutating());
  }

  #[test]
  fn test_method_parse_and_serde() {
    assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
    assert!("TRACE".parse::<HttpMethod>().is_err());
    assert_eq!(serde_json::to_value(HttpMethod::Patch).unwrap(), json!("PATCH"));
  }

  #[test]
  fn test_options_to_request() {
    let request = RequestOptions::post(json!({"a": 1}))
      .header("X-Trace", "1")
      .to_request("/api/reviews");

    assert_eq!(request.url, "/api/reviews");
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(request.body, Some(json!({"a": 1})));
    assert_eq!(request.headers, vec![("X-Trace".to_string(), "1".to_string())]);
  }

  #[test]
  fn test_relative_urls_resolve_against_base() {
    let transport = HttpTransport::new("https://tools.example.com", Duration::from_secs(1)).unwrap();
    assert_eq!(
      transport.resolve("/api/tools?limit=50").unwrap().as_str(),
      "https://tools.example.com/api/tools?limit=50"
    );
    assert_eq!(
      transport.resolve("https://cdn.example.com/x").unwrap().as_str(),
      "https://cdn.example.com/x"
    );
  }

  #[test]
  fn test_invalid_base_url_rejected() {
    assert!(HttpTransport::new("not a url", Duration::from_secs(1)).is_err());
  }
}
