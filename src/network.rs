//! Network access behind a trait, so strategies can be exercised without a
//! real origin.

use async_trait::async_trait;

use crate::error::{CacheError, Result};
use crate::request::{Request, Response};

const USER_AGENT: &str = concat!("marketcache/", env!("CARGO_PKG_VERSION"));

/// Performs a request against the origin.
///
/// `Err` means the origin could not be reached. An origin that answers with
/// an error status is `Ok` with that status.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed network caller.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(USER_AGENT)
      .build()
      .map_err(|e| CacheError::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let transport = |e: reqwest::Error| CacheError::Network {
      url: request.url.to_string(),
      message: e.to_string(),
    };

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(transport)?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
      .collect();
    let body = response.bytes().await.map_err(transport)?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
