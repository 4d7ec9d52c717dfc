//! HTTP front end.
//!
//! Serves the proxy's own endpoints under the admin prefix and hands every
//! other request to [`ProxyService`].

use crate::config::ProxyConfig;
use crate::diagnostics::DiagnosticsEntry;
use crate::error::NoExampleReason;
use crate::proxy::{CounterSnapshot, ProxyService};
use crate::request::ProxyRequest;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Front-end settings taken from the startup configuration.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub admin_prefix: String,
    pub max_request_body_bytes: usize,
}

impl ServerSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            admin_prefix: config.admin_prefix.clone(),
            max_request_body_bytes: config.max_request_body_bytes,
        }
    }
}

#[derive(Clone)]
struct AppState {
    proxy: Arc<ProxyService>,
    max_request_body_bytes: usize,
}

pub fn build_router(proxy: Arc<ProxyService>, settings: &ServerSettings) -> Router {
    let state = AppState {
        proxy,
        max_request_body_bytes: settings.max_request_body_bytes,
    };
    let prefix = settings.admin_prefix.trim_end_matches('/');

    Router::new()
        .route(&format!("{}/health", prefix), get(health))
        .route(
            &format!("{}/diagnostics", prefix),
            get(diagnostics).delete(clear_diagnostics),
        )
        .fallback(proxy_request)
        .layer(DefaultBodyLimit::max(settings.max_request_body_bytes))
        .with_state(state)
}

/// A running proxy listener.
pub struct ProxyServer {
    pub address: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl ProxyServer {
    /// Bind `listen` and serve until [`ProxyServer::close`] is called.
    pub async fn start(
        listen: SocketAddr,
        proxy: Arc<ProxyService>,
        settings: &ServerSettings,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let address = listener.local_addr()?;
        let app = build_router(proxy, settings);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(address = %address, "Proxy listening");
        Ok(Self {
            address,
            shutdown: Some(shutdown_tx),
            join,
        })
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn close(mut self) -> std::io::Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.join
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

#[derive(Serialize)]
struct HealthBody<'a> {
    status: &'static str,
    contract: Option<&'a str>,
    operations: usize,
    diagnostics_entries: usize,
    #[serde(flatten)]
    counters: CounterSnapshot,
}

async fn health(State(state): State<AppState>) -> Response {
    let proxy = &state.proxy;
    Json(HealthBody {
        status: "ok",
        contract: proxy.contract().title(),
        operations: proxy.contract().len(),
        diagnostics_entries: proxy.diagnostics().len(),
        counters: proxy.counters(),
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    limit: Option<usize>,
}

async fn diagnostics(
    State(state): State<AppState>,
    Query(query): Query<DiagnosticsQuery>,
) -> Json<Vec<DiagnosticsEntry>> {
    let recorder = state.proxy.diagnostics();
    Json(match query.limit {
        Some(limit) => recorder.last_n(limit),
        None => recorder.snapshot(),
    })
}

async fn clear_diagnostics(State(state): State<AppState>) -> StatusCode {
    state.proxy.diagnostics().clear();
    debug!("Diagnostics cleared");
    StatusCode::NO_CONTENT
}

/// Read the body, then resolve and relay, all before one deadline.
async fn proxy_request(State(state): State<AppState>, request: Request) -> Response {
    let received = tokio::time::Instant::now();
    let deadline = received + state.proxy.request_timeout();

    let (parts, body) = request.into_parts();
    let mut proxied = ProxyRequest::from_parts(&parts);
    let request = Request::from_parts(parts, body);

    let read = tokio::time::timeout_at(deadline, Bytes::from_request(request, &())).await;
    match read {
        Ok(Ok(bytes)) => proxied.body = bytes,
        Ok(Err(rejection)) => {
            let reason = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                NoExampleReason::BodyTooLarge {
                    limit: state.max_request_body_bytes,
                }
            } else {
                NoExampleReason::BodyUnreadable {
                    detail: rejection.body_text(),
                }
            };
            return state
                .proxy
                .reject_unreadable_body(&proxied, reason)
                .into_response();
        }
        Err(_) => {
            return state
                .proxy
                .reject_body_timeout(&proxied, received)
                .into_response();
        }
    }

    match state.proxy.handle_until(proxied, deadline).await {
        Ok(response) => response.into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERROR_HEADER;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method};
    use axum::routing::{get as get_route, post};
    use crate::diagnostics::Outcome;
    use crate::proxy::RequestState;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tower::ServiceExt;

    const CONTRACT: &str = r#"
openapi: 3.0.3
info:
  title: Bookshop
  version: "1.0"
paths:
  /api/books:
    get:
      operationId: listBooks
      responses:
        "200":
          content:
            application/json:
              examples:
                inStockExample:
                  value: { status: IN STOCK }
                soldOutExample:
                  value: { status: SOLD OUT }
  /api/slow:
    get:
      operationId: slow
      responses:
        "200":
          content:
            application/json:
              example: { late: true }
  /api/items:
    post:
      operationId: createItem
      responses:
        "201":
          description: Created
  /api/broken:
    get:
      operationId: broken
      responses:
        "500":
          content:
            application/json:
              example: { error: boom }
  /api/orders:
    post:
      operationId: createOrder
      responses:
        "201":
          content:
            application/json:
              example: { id: 1 }
"#;

    const RULES: &str = r#"
rules:
  - id: books-in-stock
    method: GET
    path: /api/books
    match_on:
      headers:
        prefer: "example=inStockExample"
    example: inStockExample
defaults:
  - method: GET
    path: /api/books
    example: soldOutExample
  - method: GET
    path: /api/slow
    example: default
  - method: POST
    path: /api/orders
    example: default
  - method: GET
    path: /api/broken
    example: default
"#;

    const IN_STOCK_BODY: &str = r#"{"status":"IN STOCK"}"#;

    /// Minimal stand-in for the mock engine: records the selection tokens it
    /// receives and answers with a fixed body.
    #[derive(Clone, Default)]
    struct MockEngine {
        tokens: Arc<Mutex<Vec<String>>>,
    }

    async fn mock_books(State(engine): State<MockEngine>, headers: HeaderMap) -> Response {
        let tokens: Vec<String> = headers
            .get_all("prefer")
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        engine.tokens.lock().extend(tokens);
        (
            StatusCode::OK,
            [
                ("content-type", "application/json"),
                ("x-mock-engine", "prism"),
            ],
            IN_STOCK_BODY,
        )
            .into_response()
    }

    async fn mock_slow() -> &'static str {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "late"
    }

    async fn mock_orders() -> (StatusCode, &'static str) {
        (StatusCode::CREATED, r#"{"id":1}"#)
    }

    const BROKEN_BODY: &str = r#"{"error":"boom"}"#;

    async fn mock_broken() -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [
                ("content-type", "application/json"),
                ("x-mock-engine", "prism"),
            ],
            BROKEN_BODY,
        )
            .into_response()
    }

    async fn spawn_engine(engine: MockEngine) -> SocketAddr {
        let app = Router::new()
            .route("/api/books", get_route(mock_books))
            .route("/api/slow", get_route(mock_slow))
            .route("/api/orders", post(mock_orders))
            .route("/api/broken", get_route(mock_broken))
            .with_state(engine);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    struct Harness {
        router: Router,
        proxy: Arc<ProxyService>,
        settings: ServerSettings,
        _dir: tempfile::TempDir,
    }

    fn harness(upstream: SocketAddr, tweak: impl FnOnce(&mut ProxyConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let contract = dir.path().join("openapi.yaml");
        let rules = dir.path().join("rules.yaml");
        std::fs::write(&contract, CONTRACT).unwrap();
        std::fs::write(&rules, RULES).unwrap();

        let mut config = ProxyConfig {
            contract,
            rules: Some(rules),
            upstream: format!("http://{}", upstream),
            ..ProxyConfig::default()
        };
        tweak(&mut config);

        let proxy = Arc::new(ProxyService::from_config(&config).unwrap());
        let settings = ServerSettings::from_config(&config);
        let router = build_router(proxy.clone(), &settings);
        Harness {
            router,
            proxy,
            settings,
            _dir: dir,
        }
    }

    async fn send(router: &Router, request: axum::http::Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn start(harness: &Harness) -> ProxyServer {
        ProxyServer::start("127.0.0.1:0".parse().unwrap(), harness.proxy.clone(), &harness.settings)
            .await
            .unwrap()
    }

    /// Read from a raw connection until the response head is complete.
    async fn read_head(stream: &mut TcpStream) -> String {
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut chunk))
                .await
                .expect("response head not received")
                .unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..n]);
            if received.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8_lossy(&received).into_owned()
    }

    #[tokio::test]
    async fn test_health_is_independent_of_upstream() {
        let harness = harness(unused_addr().await, |_| {});
        let (status, _, body) = send(&harness.router, get("/__proxy/health")).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["contract"], "Bookshop");
        assert_eq!(json["operations"], 5);
        assert_eq!(json["total"], 0);
    }

    #[tokio::test]
    async fn test_books_scenario_selects_in_stock_example() {
        let engine = MockEngine::default();
        let harness = harness(spawn_engine(engine.clone()).await, |_| {});

        let request = axum::http::Request::builder()
            .uri("/api/books")
            .header("prefer", "example=inStockExample")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&harness.router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, IN_STOCK_BODY.as_bytes());
        assert_eq!(headers.get("x-mock-engine").unwrap(), "prism");
        assert!(engine
            .tokens
            .lock()
            .iter()
            .any(|t| t == "example=inStockExample"));

        let entry = &harness.proxy.diagnostics().snapshot()[0];
        assert_eq!(entry.example.as_deref(), Some("inStockExample"));
    }

    #[tokio::test]
    async fn test_selection_token_never_reaches_the_client() {
        let engine = MockEngine::default();
        let harness = harness(spawn_engine(engine.clone()).await, |_| {});

        // No client-supplied prefer header, so the default example is chosen.
        let (status, headers, body) = send(&harness.router, get("/api/books?page=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, IN_STOCK_BODY.as_bytes());
        assert_eq!(*engine.tokens.lock(), vec!["example=soldOutExample".to_string()]);

        assert!(headers.get("prefer").is_none());
        for value in headers.values() {
            assert!(!value.to_str().unwrap_or("").contains("soldOutExample"));
        }
    }

    #[tokio::test]
    async fn test_undeclared_method_is_no_operation() {
        let harness = harness(unused_addr().await, |_| {});
        let request = axum::http::Request::builder()
            .method(Method::DELETE)
            .uri("/api/items")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&harness.router, request).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers.get(ERROR_HEADER).unwrap(), "no_operation");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "no_operation");
    }

    #[tokio::test]
    async fn test_operation_without_examples_is_no_example() {
        let harness = harness(unused_addr().await, |_| {});
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/items")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"widget"}"#))
            .unwrap();
        let (status, headers, body) = send(&harness.router, request).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(headers.get(ERROR_HEADER).unwrap(), "no_example");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["operation_id"], "createItem");
        assert_eq!(json["reason"]["kind"], "no_rule_matched");
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out_and_is_recorded() {
        let harness = harness(spawn_engine(MockEngine::default()).await, |config| {
            config.request_timeout_ms = 200;
        });

        let started = std::time::Instant::now();
        let (status, headers, _) = send(&harness.router, get("/api/slow")).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(headers.get(ERROR_HEADER).unwrap(), "upstream_timeout");
        assert!(started.elapsed() < Duration::from_secs(2));

        let (_, _, body) = send(&harness.router, get("/__proxy/diagnostics?limit=1")).await;
        let entries: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(entries.as_array().unwrap().len(), 1);
        assert_eq!(entries[0]["state"], "rejected_upstream_failure");
        assert_eq!(entries[0]["outcome"]["timeout"], true);
        assert_eq!(entries[0]["operation_id"], "slow");
    }

    #[tokio::test]
    async fn test_stalled_client_body_is_an_upstream_timeout() {
        let harness = harness(spawn_engine(MockEngine::default()).await, |config| {
            config.request_timeout_ms = 300;
        });
        let server = start(&harness).await;

        let mut stream = TcpStream::connect(server.address).await.unwrap();
        let started = std::time::Instant::now();
        // Announces two body bytes, sends one, then stalls.
        stream
            .write_all(
                b"POST /api/orders HTTP/1.1\r\nhost: localhost\r\n\
                  content-type: application/json\r\ncontent-length: 2\r\n\r\n{",
            )
            .await
            .unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 504"), "{}", head);
        assert!(head.contains("upstream_timeout"), "{}", head);
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(stream);

        assert_eq!(harness.proxy.counters().forwarded, 0);
        assert_eq!(harness.proxy.counters().upstream_failures, 1);
        let entry = &harness.proxy.diagnostics().snapshot()[0];
        assert_eq!(entry.state, RequestState::RejectedUpstreamFailure);
        assert_eq!(entry.operation_id.as_deref(), Some("createOrder"));
        assert!(matches!(
            entry.outcome,
            Outcome::RejectedUpstreamFailure { timeout: true, .. }
        ));

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_late_body_shortens_the_upstream_budget() {
        let harness = harness(spawn_engine(MockEngine::default()).await, |config| {
            config.request_timeout_ms = 500;
        });
        let server = start(&harness).await;

        let mut stream = TcpStream::connect(server.address).await.unwrap();
        let started = std::time::Instant::now();
        stream
            .write_all(b"GET /api/slow HTTP/1.1\r\nhost: localhost\r\ncontent-length: 2\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        stream.write_all(b"{}").await.unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 504"), "{}", head);
        assert!(head.contains("upstream_timeout"), "{}", head);
        // The upstream only gets what the body read left over.
        assert!(started.elapsed() < Duration::from_millis(750));
        drop(stream);

        assert_eq!(harness.proxy.counters().forwarded, 1);
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_relayed_unchanged() {
        let harness = harness(spawn_engine(MockEngine::default()).await, |_| {});
        let (status, headers, body) = send(&harness.router, get("/api/broken")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, BROKEN_BODY.as_bytes());
        assert_eq!(headers.get("x-mock-engine").unwrap(), "prism");
        assert!(headers.get(ERROR_HEADER).is_none());

        let entry = &harness.proxy.diagnostics().snapshot()[0];
        assert_eq!(entry.state, RequestState::Completed);
        assert_eq!(entry.outcome, Outcome::Forwarded { status: 500 });
        assert_eq!(harness.proxy.counters().forwarded, 1);
        assert_eq!(harness.proxy.counters().upstream_failures, 0);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let harness = harness(unused_addr().await, |_| {});
        let (status, headers, _) = send(&harness.router, get("/api/books")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(headers.get(ERROR_HEADER).unwrap(), "upstream_unreachable");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected_before_forwarding() {
        let engine = MockEngine::default();
        let harness = harness(spawn_engine(engine).await, |config| {
            config.max_request_body_bytes = 16;
        });

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/orders")
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"padding":"{}"}}"#, "x".repeat(64))))
            .unwrap();
        let (status, headers, _) = send(&harness.router, request).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(headers.get(ERROR_HEADER).unwrap(), "request_body_too_large");
        assert_eq!(harness.proxy.counters().forwarded, 0);

        let small = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/orders")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _, _) = send(&harness.router, small).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_diagnostics_can_be_cleared() {
        let harness = harness(unused_addr().await, |_| {});
        send(&harness.router, get("/nowhere")).await;
        send(&harness.router, get("/also/nowhere")).await;

        let (_, _, body) = send(&harness.router, get("/__proxy/diagnostics")).await;
        let entries: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(entries[0]["request"]["path"], "/also/nowhere");
        assert_eq!(entries[1]["request"]["path"], "/nowhere");

        let clear = axum::http::Request::builder()
            .method(Method::DELETE)
            .uri("/__proxy/diagnostics")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&harness.router, clear).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(harness.proxy.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn test_server_start_and_close() {
        let engine = MockEngine::default();
        let upstream = spawn_engine(engine).await;
        let harness = harness(upstream, |_| {});
        let server = start(&harness).await;

        let response = reqwest::get(format!("http://{}/api/books", server.address))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), IN_STOCK_BODY);

        server.close().await.unwrap();
    }
}
