// End-to-end test: a fake origin, the worker proxy in front of it, and a
// client talking to the proxy over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{StatusCode, header};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use offline_sw::server::{install_with_retry, serve};
use offline_sw::{
    CacheStorage, HttpNetwork, MemoryStorage, Network, NoProgress, RedirectMode, Request, Worker,
    WorkerConfig, WorkerState,
};

struct Running {
    addr: SocketAddr,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// Fake Django origin serving the four icons and one page.
async fn start_origin(with_touch_icon: bool) -> Running {
    let mut app = Router::new()
        .route("/static/images/favicon.ico", get(|| async { "favicon" }))
        .route("/static/images/android-chrome-192x192.png", get(|| async { "png-192" }))
        .route("/static/images/android-chrome-512x512.png", get(|| async { "png-512" }))
        .route("/dashboard/", get(|| async { "dashboard" }))
        .route(
            "/accounts/login/",
            post(|| async {
                (
                    StatusCode::FOUND,
                    [
                        (header::LOCATION, "/dashboard/"),
                        (header::SET_COOKIE, "sessionid=abc; Path=/"),
                    ],
                )
            }),
        );
    if with_touch_icon {
        app = app.route("/static/images/apple-touch-icon.png", get(|| async { "touch" }));
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });
    Running { addr, token, handle }
}

type TestWorker = Worker<HttpNetwork, MemoryStorage>;

fn worker_for(origin: SocketAddr) -> Arc<TestWorker> {
    let config = WorkerConfig::new().with_origin(format!("http://{origin}"));
    Arc::new(Worker::new(config, HttpNetwork::new().unwrap(), MemoryStorage::new()))
}

async fn start_proxy(worker: Arc<TestWorker>) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    let handle = tokio::spawn(async move {
        serve(worker, listener, shutdown).await.unwrap();
    });
    Running { addr, token, handle }
}

async fn get_text(client: &reqwest::Client, proxy: SocketAddr, path: &str) -> (u16, String) {
    let resp = client
        .get(format!("http://{proxy}{path}"))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

#[tokio::test]
async fn serves_network_first_then_falls_back_to_cache() {
    let origin = start_origin(true).await;
    let worker = worker_for(origin.addr);
    install_with_retry(&worker, 1, Duration::ZERO, &NoProgress)
        .await
        .unwrap();
    assert_eq!(worker.state(), WorkerState::Installed);

    let proxy = start_proxy(Arc::clone(&worker)).await;
    let client = reqwest::Client::new();

    // Online: everything comes from the origin.
    assert_eq!(
        get_text(&client, proxy.addr, "/static/images/favicon.ico").await,
        (200, "favicon".to_string())
    );
    assert_eq!(
        get_text(&client, proxy.addr, "/dashboard/").await,
        (200, "dashboard".to_string())
    );
    assert_eq!(get_text(&client, proxy.addr, "/nope").await.0, 404);

    let (status, health) = get_text(&client, proxy.addr, "/__worker/health").await;
    assert_eq!(status, 200);
    let health: serde_json::Value = serde_json::from_str(&health).unwrap();
    assert_eq!(health["state"], "installed");

    // Origin goes away.
    origin.stop().await;

    assert_eq!(
        get_text(&client, proxy.addr, "/static/images/favicon.ico").await,
        (200, "favicon".to_string())
    );
    assert_eq!(get_text(&client, proxy.addr, "/dashboard/").await.0, 502);

    let (_, stats) = get_text(&client, proxy.addr, "/__worker/stats").await;
    let stats: serde_json::Value = serde_json::from_str(&stats).unwrap();
    assert_eq!(stats["network"], 3);
    assert_eq!(stats["cache"], 1);
    assert_eq!(stats["unresolved"], 1);

    // Live responses were never added.
    let keys = worker.storage().keys("django-pwa-v1").await.unwrap();
    assert_eq!(keys.len(), 4);
    assert!(keys.iter().all(|k| k.contains("/static/images/")));

    proxy.stop().await;
}

#[tokio::test]
async fn missing_asset_fails_install_and_caches_nothing() {
    let origin = start_origin(false).await;
    let worker = worker_for(origin.addr);

    let err = install_with_retry(&worker, 2, Duration::from_millis(10), &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, offline_sw::Error::AssetStatus { status: 404, .. }));
    assert_eq!(worker.state(), WorkerState::Failed);
    assert!(worker.storage().keys("django-pwa-v1").await.unwrap().is_empty());

    origin.stop().await;
}

#[tokio::test]
async fn login_redirect_reaches_the_browser_unchanged() {
    let origin = start_origin(true).await;
    let worker = worker_for(origin.addr);
    install_with_retry(&worker, 1, Duration::ZERO, &NoProgress)
        .await
        .unwrap();
    let proxy = start_proxy(Arc::clone(&worker)).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let resp = client
        .post(format!("http://{}/accounts/login/", proxy.addr))
        .body("username=a&password=b")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 302);
    assert_eq!(resp.headers()["location"], "/dashboard/");
    assert_eq!(resp.headers()["set-cookie"], "sessionid=abc; Path=/");
    assert_eq!(worker.stats().snapshot().network, 1);

    proxy.stop().await;
    origin.stop().await;
}

#[tokio::test]
async fn redirect_mode_selects_follow_or_manual() {
    let origin = start_origin(true).await;
    let network = HttpNetwork::new().unwrap();
    let url = reqwest::Url::parse(&format!("http://{}/accounts/login/", origin.addr)).unwrap();

    let mut request = Request::get(url);
    request.method = reqwest::Method::POST;
    request.redirect = RedirectMode::Manual;
    let manual = network.fetch(&request).await.unwrap();
    assert_eq!(manual.status, 302);
    assert_eq!(manual.header("set-cookie"), Some("sessionid=abc; Path=/"));

    request.redirect = RedirectMode::Follow;
    let followed = network.fetch(&request).await.unwrap();
    assert_eq!(followed.status, 200);
    assert!(followed.url.ends_with("/dashboard/"));
    assert_eq!(&followed.body[..], b"dashboard");

    origin.stop().await;
}
