//! Local HTTP host for the worker.
//!
//! The server stands in for the platform: it installs the worker before it
//! accepts connections, retrying failed installs on its own schedule, and then
//! turns every incoming request into a fetch event for the worker's origin.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStorage;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::http::{RedirectMode, Request, Response, is_hop_by_hop};
use crate::network::Network;
use crate::stats::{FetchCounts, InstallStats};
use crate::worker::{FetchOutcome, InstallProgress, Worker, WorkerState};

/// Largest request body forwarded to the network.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// A worker shared between connection handlers.
pub type SharedWorker<N, S> = Arc<Worker<N, S>>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state: WorkerState,
}

async fn worker_health<N, S>(State(worker): State<SharedWorker<N, S>>) -> impl IntoResponse
where
    N: Network + 'static,
    S: CacheStorage + 'static,
{
    axum::Json(HealthResponse {
        status: "ok",
        state: worker.state(),
    })
}

async fn worker_stats<N, S>(State(worker): State<SharedWorker<N, S>>) -> axum::Json<FetchCounts>
where
    N: Network + 'static,
    S: CacheStorage + 'static,
{
    axum::Json(worker.stats().snapshot())
}

/// Turns an incoming request into a fetch event against the worker's origin.
///
/// Only the path and query of the incoming URI are used, so the target
/// always stays on the configured origin.
async fn to_fetch_request<N, S>(
    worker: &Worker<N, S>,
    req: axum::extract::Request,
) -> std::result::Result<Request, (StatusCode, String)>
where
    N: Network,
    S: CacheStorage,
{
    let (parts, body) = req.into_parts();

    let mut url = worker
        .config()
        .origin_url()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| match value.to_str() {
            Ok(v) => Some((name.as_str().to_string(), v.to_string())),
            Err(_) => {
                log::debug!("Dropping non-ASCII request header {name}");
                None
            }
        })
        .collect();

    let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|e| (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()))?;

    Ok(Request {
        method: parts.method,
        url,
        headers,
        body,
        redirect: RedirectMode::Manual,
    })
}

fn to_http_response(resp: Response) -> HttpResponse {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in &resp.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => log::debug!("Dropping invalid response header {name:?}"),
        }
    }
    (status, headers, resp.body).into_response()
}

async fn dispatch<N, S>(
    State(worker): State<SharedWorker<N, S>>,
    req: axum::extract::Request,
) -> HttpResponse
where
    N: Network + 'static,
    S: CacheStorage + 'static,
{
    let request = match to_fetch_request(&worker, req).await {
        Ok(request) => request,
        Err(rejection) => return rejection.into_response(),
    };

    match worker.handle_fetch(&request).await {
        Ok(FetchOutcome::Network(resp) | FetchOutcome::Cache(resp)) => to_http_response(resp),
        // The request fails as it would with no worker in front of it.
        Ok(FetchOutcome::Unresolved(e)) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
        Err(e) => {
            log::error!("Cache lookup failed for {}: {e}", request.url);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Builds the router: worker status endpoints plus a catch-all that feeds the
/// fetch handler.
pub fn router<N, S>(worker: SharedWorker<N, S>) -> Router
where
    N: Network + 'static,
    S: CacheStorage + 'static,
{
    Router::new()
        .route("/__worker/health", get(worker_health::<N, S>))
        .route("/__worker/stats", get(worker_stats::<N, S>))
        .fallback(dispatch::<N, S>)
        .with_state(worker)
}

/// Installs the worker, retrying up to `attempts` times with `delay` between
/// attempts.
///
/// # Errors
///
/// Returns the last install error once every attempt has failed, or
/// [`Error::Config`] if `attempts` is zero.
pub async fn install_with_retry<N, S>(
    worker: &Worker<N, S>,
    attempts: u32,
    delay: Duration,
    progress: &dyn InstallProgress,
) -> Result<InstallStats>
where
    N: Network,
    S: CacheStorage,
{
    if attempts == 0 {
        return Err(Error::Config("install_attempts must be at least 1".into()));
    }
    let mut attempt = 1;
    loop {
        match worker.install(progress).await {
            Ok(stats) => return Ok(stats),
            Err(e) if attempt < attempts => {
                log::warn!(
                    "Install attempt {attempt}/{attempts} failed: {e}; retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Serves fetch events on `listener` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve<N, S>(
    worker: SharedWorker<N, S>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()>
where
    N: Network + 'static,
    S: CacheStorage + 'static,
{
    axum::serve(listener, router(worker))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Installs the worker, binds the configured address and serves until
/// `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if install never succeeds, the address cannot be bound,
/// or the server fails.
pub async fn run<N, S>(
    worker: SharedWorker<N, S>,
    config: &ServerConfig,
    progress: &dyn InstallProgress,
    shutdown: CancellationToken,
) -> Result<()>
where
    N: Network + 'static,
    S: CacheStorage + 'static,
{
    install_with_retry(
        &worker,
        config.install_attempts,
        Duration::from_secs(config.install_retry_delay_secs),
        progress,
    )
    .await?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    log::info!(
        "Serving {} for {} on http://{}",
        worker.config().cache_name,
        worker.config().origin,
        listener.local_addr()?
    );

    serve(worker, listener, shutdown).await?;
    log::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;
    use crate::config::WorkerConfig;
    use crate::network::OfflineNetwork;
    use crate::worker::NoProgress;
    use bytes::Bytes;

    #[test]
    fn response_conversion_drops_hop_by_hop_headers() {
        let resp = to_http_response(Response {
            url: "http://localhost/".into(),
            status: 203,
            headers: vec![
                ("Transfer-Encoding".into(), "chunked".into()),
                ("Content-Type".into(), "text/plain".into()),
                ("X-Bad\n".into(), "ignored".into()),
            ],
            body: Bytes::from_static(b"hi"),
        });
        assert_eq!(resp.status(), StatusCode::NON_AUTHORITATIVE_INFORMATION);
        assert!(resp.headers().get("transfer-encoding").is_none());
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    }

    #[tokio::test]
    async fn install_with_retry_gives_up_after_attempts() {
        let worker = Worker::new(WorkerConfig::new(), OfflineNetwork, MemoryStorage::new());
        let err = install_with_retry(&worker, 2, Duration::from_millis(1), &NoProgress)
            .await
            .unwrap_err();
        assert!(err.is_network());
        assert_eq!(worker.state(), WorkerState::Failed);
    }

    #[tokio::test]
    async fn install_with_retry_rejects_zero_attempts() {
        let worker = Worker::new(WorkerConfig::new(), OfflineNetwork, MemoryStorage::new());
        let err = install_with_retry(&worker, 0, Duration::ZERO, &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(worker.state(), WorkerState::Parsed);
    }
}
