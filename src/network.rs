//! Network abstraction for testability.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::http::{RedirectMode, Request, Response, is_hop_by_hop};

/// Something that can perform a live request.
///
/// Implementations return `Ok` for every response the server produced,
/// whatever its status; `Err` is reserved for requests that never got a
/// response.
#[async_trait]
pub trait Network: Send + Sync {
    /// Performs `request` against the real network.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

#[async_trait]
impl<N: Network + ?Sized> Network for std::sync::Arc<N> {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        (**self).fetch(request).await
    }
}

/// Network implementation backed by shared `reqwest` clients, one per
/// [`RedirectMode`].
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    follow: reqwest::Client,
    manual: reqwest::Client,
}

fn build_client(policy: reqwest::redirect::Policy) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .redirect(policy)
        .build()?)
}

impl HttpNetwork {
    /// Creates a network with clients tuned for a long-running worker.
    ///
    /// No request timeout is set: requests are bounded by the network
    /// stack's own behaviour.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        Ok(Self {
            follow: build_client(reqwest::redirect::Policy::default())?,
            manual: build_client(reqwest::redirect::Policy::none())?,
        })
    }

    const fn client(&self, mode: RedirectMode) -> &reqwest::Client {
        match mode {
            RedirectMode::Follow => &self.follow,
            RedirectMode::Manual => &self.manual,
        }
    }
}

fn header_pairs(headers: &reqwest::header::HeaderMap, url: &str) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| match v.to_str() {
            Ok(v) => Some((k.as_str().to_string(), v.to_string())),
            Err(_) => {
                log::debug!("Dropping non-ASCII header {k} from {url}");
                None
            }
        })
        .collect()
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client(request.redirect)
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let url = request.url.to_string();
        let network_error = |e: reqwest::Error| Error::Network {
            url: url.clone(),
            reason: e.to_string(),
        };

        let resp = builder.send().await.map_err(network_error)?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let headers = header_pairs(resp.headers(), &final_url);
        // A connection dropped mid-body is still a failed request.
        let body = resp.bytes().await.map_err(network_error)?;

        log::debug!("{} {} -> {status}", request.method, request.url);

        Ok(Response {
            url: final_url,
            status,
            headers,
            body,
        })
    }
}

/// A network that is always unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineNetwork;

#[async_trait]
impl Network for OfflineNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        Err(Error::Network {
            url: request.url.to_string(),
            reason: "network is offline".to_string(),
        })
    }
}
