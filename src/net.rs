//! Network access behind a trait so the worker and fetcher can be tested offline.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Url;

use crate::error::{Error, Result};
use crate::request::{Method, Request, RequestMode, Response, ResponseKind};

/// An open response body delivered chunk by chunk.
pub struct BodyStream {
    pub status: u16,
    /// Declared `Content-Length`, if the server sent one.
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes>>,
}

/// Abstraction over the network for testability.
#[async_trait]
pub trait Network: Send + Sync {
    /// Performs a request and buffers the whole response.
    async fn fetch(&self, request: &Request) -> Result<Response>;

    /// Opens a `GET` stream for `url` without buffering the body.
    async fn stream(&self, url: &str) -> Result<BodyStream>;
}

/// Builds a configured HTTP client.
fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .user_agent(concat!("nyvera/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// `reqwest`-backed network with browser-like response tainting.
///
/// Responses from `origin` are [`ResponseKind::Basic`]. Cross-origin
/// responses are [`ResponseKind::Cors`] for CORS requests and
/// [`ResponseKind::Opaque`] for no-cors requests.
pub struct HttpNetwork {
    client: reqwest::Client,
    origin: Option<Url>,
}

impl HttpNetwork {
    /// Creates a network whose requests are judged against `origin`.
    ///
    /// # Errors
    ///
    /// Returns an error if `origin` is not a valid URL or the client cannot be built.
    pub fn new(origin: Option<&str>) -> Result<Self> {
        Self::with_client(build_http_client()?, origin)
    }

    /// Creates a network around an existing client.
    ///
    /// # Errors
    ///
    /// Returns an error if `origin` is not a valid URL.
    pub fn with_client(client: reqwest::Client, origin: Option<&str>) -> Result<Self> {
        let origin = origin
            .map(|o| Url::parse(o).map_err(|e| Error::Config(format!("invalid origin {o:?}: {e}"))))
            .transpose()?;
        Ok(Self { client, origin })
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        self.origin
            .as_ref()
            .is_none_or(|origin| origin.origin() == url.origin())
    }

    fn classify(&self, request: &Request, final_url: &Url) -> ResponseKind {
        if self.is_same_origin(final_url) {
            ResponseKind::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseKind::Opaque
        } else {
            ResponseKind::Cors
        }
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn network_error(url: &str, e: &reqwest::Error) -> Error {
    Error::Network(format!("{url}: {e}"))
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = Url::parse(&request.url)
            .map_err(|e| Error::Network(format!("invalid URL {:?}: {e}", request.url)))?;
        if request.mode == RequestMode::SameOrigin && !self.is_same_origin(&url) {
            return Err(Error::Network(format!(
                "{}: cross-origin request in same-origin mode",
                request.url
            )));
        }

        let resp = self
            .client
            .request(to_reqwest_method(request.method), url)
            .send()
            .await
            .map_err(|e| network_error(&request.url, &e))?;

        let kind = self.classify(request, resp.url());
        if kind == ResponseKind::Opaque {
            log::debug!("Opaque response for {}", request.url);
            return Ok(Response::opaque(request.url.clone()));
        }

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| network_error(&request.url, &e))?;

        Ok(Response {
            url: request.url.clone(),
            status,
            headers,
            kind,
            body,
        })
    }

    async fn stream(&self, url: &str) -> Result<BodyStream> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| network_error(url, &e))?;

        let owned_url = url.to_string();
        Ok(BodyStream {
            status: resp.status().as_u16(),
            content_length: resp.content_length(),
            chunks: resp
                .bytes_stream()
                .map(move |chunk| chunk.map_err(|e| network_error(&owned_url, &e)))
                .boxed(),
        })
    }
}
