//! Transport collaborator
//!
//! The rest of the crate speaks to the backend only through the [`Transport`]
//! trait: one request in, status/headers/body out, plus a streaming variant
//! for large downloads. [`ReqwestTransport`] is the production
//! implementation; tests substitute in-memory fakes.
//!
//! [`HttpExecutor`] layers credentials, requester-pays billing, retries,
//! status validation and metrics on top of a transport.

mod credentials;
mod executor;
mod urls;

pub use credentials::{
    AccessToken, Anonymous, CredentialProvider, RefreshingToken, StaticToken, TokenSource,
};
pub use executor::HttpExecutor;
pub use urls::ApiUrls;

use crate::error::{StorageError, TransportErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Build a header value, rejecting control characters
pub fn header_value(value: &str) -> Result<HeaderValue, StorageError> {
    HeaderValue::from_str(value)
        .map_err(|e| StorageError::InvalidArgument(format!("invalid header value: {}", e)))
}

/// One outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json_body<T: serde::Serialize>(self, value: &T) -> Result<Self, StorageError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| StorageError::InvalidArgument(format!("unserializable body: {}", e)))?;
        Ok(self
            .header(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .body(body))
    }
}

/// A fully buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Header value as text, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decode the body as JSON; a malformed body is a protocol fault
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| StorageError::Protocol(format!("malformed response body: {}", e)))
    }
}

/// A response whose body arrives incrementally
pub struct StreamingResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, StorageError>>,
}

impl StreamingResponse {
    /// Collect the remaining body into memory
    pub async fn collect(mut self) -> Result<HttpResponse, StorageError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(HttpResponse {
            status: self.status,
            headers: self.headers,
            body: Bytes::from(buf),
        })
    }
}

/// Request executor capability
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one request and buffer the response
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, StorageError>;

    /// Issue one request and stream the response body.
    ///
    /// The default buffers through [`Transport::request`].
    async fn stream(&self, request: HttpRequest) -> Result<StreamingResponse, StorageError> {
        let response = self.request(request).await?;
        Ok(StreamingResponse {
            status: response.status,
            headers: response.headers,
            body: stream::once(async move { Ok(response.body) }).boxed(),
        })
    }
}

/// Transport backed by a pooled `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::transport(TransportErrorKind::Builder, e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, request: HttpRequest) -> Result<reqwest::Response, StorageError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        Ok(builder.send().await?)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, StorageError> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn stream(&self, request: HttpRequest) -> Result<StreamingResponse, StorageError> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StorageError::from))
            .boxed();
        Ok(StreamingResponse {
            status,
            headers,
            body,
        })
    }
}
