//! Request and response values passed between the worker, the cache and the network.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// HTTP method of an intercepted request. Only `GET` is ever cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Parses a method name, falling back to `None` for anything unsupported.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// What kind of resource the requester intends to use the response as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Document,
    Script,
    Style,
    Image,
    Manifest,
    Font,
    #[default]
    Other,
}

impl Destination {
    /// Guesses the destination from the extension of a URL path.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        if path.is_empty() || path.ends_with('/') {
            return Self::Document;
        }
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "html" | "htm" => Self::Document,
            "js" | "mjs" => Self::Script,
            "css" => Self::Style,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "avif" => Self::Image,
            "webmanifest" => Self::Manifest,
            "json" if path.ends_with("manifest.json") => Self::Manifest,
            "woff" | "woff2" | "ttf" | "otf" => Self::Font,
            _ => Self::Other,
        }
    }

    /// Maps the value of a `Sec-Fetch-Dest` header.
    #[must_use]
    pub fn from_fetch_dest(value: &str) -> Option<Self> {
        match value {
            "document" | "iframe" => Some(Self::Document),
            "script" | "worker" | "serviceworker" => Some(Self::Script),
            "style" => Some(Self::Style),
            "image" => Some(Self::Image),
            "manifest" => Some(Self::Manifest),
            "font" => Some(Self::Font),
            "empty" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Request mode, deciding whether a cross-origin response is readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    SameOrigin,
    Cors,
    #[default]
    NoCors,
}

/// An intercepted resource request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Absolute URL of the resource.
    pub url: String,
    pub method: Method,
    pub destination: Destination,
    pub mode: RequestMode,
}

impl Request {
    /// Creates a `GET` request, guessing the destination from the URL.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        let url = url.into();
        let destination = Destination::from_path(url_path(&url));
        Self {
            url,
            method: Method::Get,
            destination,
            mode: RequestMode::default(),
        }
    }

    #[must_use]
    pub const fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub const fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Returns the path part of an absolute or relative URL.
fn url_path(url: &str) -> &str {
    match url.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("/", |i| &rest[i..]),
        None => url,
    }
}

/// How much of a response the requester is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Same-origin response.
    Basic,
    /// Cross-origin response readable under CORS.
    Cors,
    /// Cross-origin no-cors response: status and body are hidden.
    Opaque,
    /// Network error.
    Error,
}

/// A captured response: status, headers and the full body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// URL the response was produced for.
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub kind: ResponseKind,
    pub body: Bytes,
}

impl Response {
    /// Creates a same-origin `200 OK` response with the given body.
    #[must_use]
    pub fn ok(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            status: 200,
            headers: Vec::new(),
            kind: ResponseKind::Basic,
            body: body.into(),
        }
    }

    /// Synthetic empty `404` used when an image cannot be fetched offline.
    #[must_use]
    pub fn not_found(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 404,
            headers: Vec::new(),
            kind: ResponseKind::Basic,
            body: Bytes::new(),
        }
    }

    /// Opaque response as seen by a no-cors requester: no status, no body.
    #[must_use]
    pub fn opaque(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 0,
            headers: Vec::new(),
            kind: ResponseKind::Opaque,
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    /// Status is in the 2xx range.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Only readable, successful responses may be persisted.
    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        matches!(self.kind, ResponseKind::Basic | ResponseKind::Cors) && self.is_success()
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_from_extension() {
        assert_eq!(Destination::from_path("/"), Destination::Document);
        assert_eq!(Destination::from_path("/index.html"), Destination::Document);
        assert_eq!(Destination::from_path("/app.js"), Destination::Script);
        assert_eq!(Destination::from_path("/style.css?v=2"), Destination::Style);
        assert_eq!(Destination::from_path("/img/logo.PNG"), Destination::Image);
        assert_eq!(Destination::from_path("/manifest.json"), Destination::Manifest);
        assert_eq!(Destination::from_path("/data.json"), Destination::Other);
        assert_eq!(Destination::from_path("/unet/model.onnx"), Destination::Other);
    }

    #[test]
    fn get_guesses_destination_from_absolute_url() {
        let req = Request::get("https://example.com/icons/icon-192.svg");
        assert_eq!(req.destination, Destination::Image);
        assert_eq!(req.method, Method::Get);

        let root = Request::get("https://example.com");
        assert_eq!(root.destination, Destination::Document);
    }

    #[test]
    fn fetch_dest_header() {
        assert_eq!(Destination::from_fetch_dest("image"), Some(Destination::Image));
        assert_eq!(Destination::from_fetch_dest("audio"), None);
    }

    #[test]
    fn method_parse() {
        assert_eq!(Method::parse("get"), Some(Method::Get));
        assert_eq!(Method::parse("PATCH"), None);
        assert_eq!(Method::Post.as_str(), "POST");
    }

    #[test]
    fn cacheability() {
        assert!(Response::ok("/a", "x").is_cacheable());
        assert!(
            Response::ok("/a", "x")
                .with_kind(ResponseKind::Cors)
                .is_cacheable()
        );
        assert!(!Response::opaque("https://cdn.example/a").is_cacheable());
        assert!(!Response::not_found("/a").is_cacheable());
    }

    #[test]
    fn header_lookup_ignores_case() {
        let resp = Response::ok("/a", "x").with_header("Content-Type", "text/plain");
        assert_eq!(resp.header("content-type"), Some("text/plain"));
        assert_eq!(resp.header("etag"), None);
    }
}
