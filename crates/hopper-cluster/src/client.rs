//! HTTP transport seam.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

const DEFAULT_USER_AGENT: &str = "hopper (rust-client)";
const DEFAULT_ACCEPT: &str = "text/plain";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A completed request. Statuses are data, not errors: callers routinely
/// branch on 404 vs 200, so only transport failures surface as `Err`.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    body: Bytes,
}

impl Response {
    pub fn new(status: u16, body: Bytes) -> Self {
        Self { status, body }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as lossy UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Abstraction for requesting information from peers over some transport.
#[async_trait]
pub trait Client: Send + Sync {
    /// Send a GET and return the response, or an error if the request
    /// could not be completed.
    async fn get(&self, url: &str) -> Result<Response>;

    /// Send a POST with a body and return the response, or an error if
    /// the request could not be completed.
    async fn post(&self, url: &str, body: Bytes) -> Result<Response>;
}

/// [`Client`] over reqwest.
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Client for HttpClient {
    async fn get(&self, url: &str) -> Result<Response> {
        let resp = self
            .inner
            .get(url)
            .header(reqwest::header::ACCEPT, DEFAULT_ACCEPT)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        Ok(Response::new(status, body))
    }

    async fn post(&self, url: &str, body: Bytes) -> Result<Response> {
        let resp = self
            .inner
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, DEFAULT_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        Ok(Response::new(status, body))
    }
}
