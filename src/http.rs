//! Request and response values passed between the worker, the network and
//! the cache.

use bytes::Bytes;
use reqwest::{Method, Url};

use crate::error::{Error, Result};

/// Headers that describe a single connection and must not be forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Returns true if `name` is a hop-by-hop header.
#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Parses an absolute URL.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if `input` is not an absolute URL.
pub fn parse_url(input: &str) -> Result<Url> {
    Url::parse(input).map_err(|e| Error::InvalidUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Normalizes a URL into a cache key: the fragment never takes part in
/// matching.
#[must_use]
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// How redirects answered to a request are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Follow redirects and return the final response.
    #[default]
    Follow,
    /// Return 3xx responses as they are.
    Manual,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Absolute request URL.
    pub url: Url,
    /// End-to-end request headers.
    pub headers: Vec<(String, String)>,
    /// Request body (empty for `GET`).
    pub body: Bytes,
    /// Redirect handling on the network.
    pub redirect: RedirectMode,
}

impl Request {
    /// Creates a `GET` request for `url` with no headers.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
            redirect: RedirectMode::Follow,
        }
    }

    /// Key under which this request is stored in and looked up from a cache.
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }
}

/// A response, either fresh from the network or replayed from a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Final URL the response came from.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
}

impl Response {
    /// Returns true for a 2xx status.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Returns the first header named `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
