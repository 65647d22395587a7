//! Session resilience gateway
//!
//! Single-binary service fronting an unreliable browser-automation backend:
//! 1. Serializes API requests against the one automation session
//! 2. Selects a credential profile from the prioritized pool
//! 3. Races three retrieval channels (TLS tap, status poll, final harvest)
//! 4. Classifies terminal failures and rotates/retries per policy
//! 5. Runs the TLS interception proxy that feeds the tap channel

mod channels;
mod config;
mod error;
mod metrics;
mod orchestrator;
mod retry;
mod session;
#[cfg(test)]
mod testutil;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use driver::{Driver, HttpDriver};
use intercept::{Interceptor, LeafCache, RootAuthority, TapRegistry, tls_connector};
use metrics_exporter_prometheus::PrometheusHandle;
use session_pool::{CooldownConfig, PoolManager, ProfileStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::Error;
use crate::orchestrator::{Orchestrator, RetrievalError, Timers};
use crate::retry::{AttemptError, RetryPolicy};
use crate::session::Admission;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<PoolManager>,
    admission: Arc<Admission>,
    orchestrator: Arc<Orchestrator>,
    driver: Arc<dyn Driver>,
    retry: RetryPolicy,
    authority: Arc<RootAuthority>,
    leaf_cache: Arc<LeafCache>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit bounds queued requests; admitted requests still
/// serialize one at a time against the automation session.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/completions", post(completion_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-gateway");

    // Install the Prometheus recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        intercept_addr = %config.intercept.listen_addr,
        pools_dir = %config.pools.dir.display(),
        driver = %config.driver.base_url,
        "configuration loaded"
    );

    // Credential pool: every profile starts Unverified and must pass the
    // canary before first use.
    let store = ProfileStore::open(config.pools.dir.clone())
        .context("failed to open credential profile store")?;
    let pool = Arc::new(
        PoolManager::from_store(
            &store,
            CooldownConfig {
                rate_limit: Duration::from_secs(config.cooldown.rate_limit_secs),
                quota_exceeded: Duration::from_secs(config.cooldown.quota_exceeded_secs),
            },
        )
        .await
        .context("failed to scan credential pools")?,
    );

    // Interception proxy: persisted root authority, per-host leaves, tap
    // feeding retrieval channel A.
    let authority = Arc::new(
        RootAuthority::open(config.intercept.root_ca_path.clone())
            .context("failed to open root certificate authority")?,
    );
    let leaf_cache = Arc::new(LeafCache::new(authority.clone()));
    let tap = Arc::new(TapRegistry::new());
    let connector = tls_connector().context("failed to build upstream TLS connector")?;
    let interceptor = Arc::new(Interceptor::new(leaf_cache.clone(), tap.clone(), connector));

    let intercept_listener = TcpListener::bind(config.intercept.listen_addr)
        .await
        .with_context(|| format!("failed to bind intercept to {}", config.intercept.listen_addr))?;
    info!(addr = %config.intercept.listen_addr, "interception proxy listening");
    tokio::spawn({
        let interceptor = interceptor.clone();
        async move {
            if let Err(e) = interceptor.serve(intercept_listener).await {
                error!(error = %e, "interception proxy exited");
            }
        }
    });

    let driver: Arc<dyn Driver> = Arc::new(
        HttpDriver::new(config.driver.base_url.clone(), config.request_timeout())
            .map_err(|e| anyhow::anyhow!("failed to build driver client: {e}"))?,
    );

    let orchestrator = Arc::new(Orchestrator::new(
        driver.clone(),
        tap,
        config.poll_interval(),
        Timers {
            first_byte: config.first_byte_timeout(),
            escalation: config.escalation_timeout(),
            request_ceiling: config.request_timeout(),
        },
    ));

    let state = AppState {
        pool,
        admission: Arc::new(Admission::new()),
        orchestrator,
        driver,
        retry: RetryPolicy {
            max_attempts: config.retry.max_attempts,
            backoff_base: Duration::from_secs(config.retry.backoff_base_secs),
            backoff_cap: Duration::from_secs(config.retry.backoff_cap_secs),
        },
        authority,
        leaf_cache,
        prometheus,
    };

    let app = build_router(state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "accepting requests");

    // Graceful shutdown: stop accepting on SIGTERM/SIGINT, drain in-flight
    // requests, but never let a slow client block process exit past the
    // drain timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Completion route: submit opaque request content, answer with the retrieved
/// text or one typed JSON error. 403 retries are invisible to the caller.
async fn completion_handler(State(state): State<AppState>, body: String) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let started = std::time::Instant::now();

    // The watch sender lives in a drop guard: if the client disconnects,
    // axum drops this handler future, the guard flips the flag, and the
    // spawned request task cancels cleanly (aborting the driver submission
    // without touching pool state).
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let _guard = CancelOnDrop { tx: cancel_tx };

    let task = tokio::spawn(run_request(
        state.clone(),
        body,
        request_id.clone(),
        cancel_rx,
    ));

    let result = match task.await {
        Ok(result) => result,
        Err(e) => Err(Error::Backend(format!("request task failed: {e}"))),
    };

    match result {
        Ok(text) => {
            metrics::record_request(None, started.elapsed());
            info!(request_id = %request_id, elapsed_ms = started.elapsed().as_millis() as u64, "request complete");
            (
                axum::http::StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                serde_json::json!({ "text": text, "request_id": request_id }).to_string(),
            )
                .into_response()
        }
        Err(err) => {
            metrics::record_request(Some(err.error_type()), started.elapsed());
            warn!(request_id = %request_id, error = %err, "request failed");
            err.into_response_with_id(&request_id)
        }
    }
}

struct CancelOnDrop {
    tx: watch::Sender<bool>,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// Drive one request end to end: admission, then the retry loop around
/// submit + three-channel retrieval.
async fn run_request(
    state: AppState,
    body: String,
    request_id: String,
    cancel: watch::Receiver<bool>,
) -> error::Result<String> {
    // Wait for the single automation session, but not past a client
    // disconnect while queued.
    let mut cancel_wait = cancel.clone();
    let _permit = tokio::select! {
        permit = state.admission.acquire() => permit,
        _ = cancel_wait.wait_for(|cancelled| *cancelled) => return Err(Error::Cancelled),
    };

    let driver = state.driver.clone();
    let orchestrator = state.orchestrator.clone();
    let body = Arc::new(body);

    state
        .retry
        .run(&state.pool, move |profile, _attempt| {
            let driver = driver.clone();
            let orchestrator = orchestrator.clone();
            let body = body.clone();
            let cancel = cancel.clone();
            let request_id = request_id.clone();
            async move {
                tracing::debug!(
                    request_id = %request_id,
                    profile_id = %profile.id,
                    "submitting via driver"
                );
                let handle = driver.submit(&body).await.map_err(|e| AttemptError::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                })?;

                match orchestrator.retrieve(handle, cancel).await {
                    Ok(text) => Ok(text),
                    Err(RetrievalError::Cancelled) => Err(AttemptError::Cancelled),
                    Err(RetrievalError::Failed(kind)) => Err(AttemptError::Failed {
                        kind,
                        message: format!("retrieval failed: {}", kind.label()),
                    }),
                }
            }
        })
        .await
}

/// Health endpoint: pool snapshot plus intercept status. 503 only when the
/// pool is fully exhausted.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.snapshot().await;
    let status_code = if pool["status"] == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": pool["status"],
        "pool": pool,
        "intercept": {
            "root_generation": state.authority.generation(),
            "cached_leaves": state.leaf_cache.len(),
        },
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockDriver;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::Secret;
    use driver::{FailureKind, SubmissionStatus};
    use session_pool::{AuthProfile, PoolBucket};
    use tower::ServiceExt;

    const FAR_FUTURE: i64 = 4_102_444_800;

    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn profile(id: &str, bucket: PoolBucket) -> AuthProfile {
        AuthProfile::unverified(
            id.into(),
            bucket,
            Secret::new(format!(
                r#"{{"cookies":[{{"name":"sid","value":"x","expires":{FAR_FUTURE}}}]}}"#
            )),
        )
    }

    /// Build app state over a scripted driver and in-memory pool, with timers
    /// short enough for real-clock tests.
    fn test_app_state(driver: Arc<MockDriver>, profiles: Vec<AuthProfile>) -> AppState {
        let authority_dir = tempfile::tempdir().unwrap();
        let authority =
            Arc::new(RootAuthority::open(authority_dir.path().join("root-ca")).unwrap());
        // Leak the tempdir so the authority files outlive the test state.
        std::mem::forget(authority_dir);

        let leaf_cache = Arc::new(LeafCache::new(authority.clone()));
        let tap = Arc::new(TapRegistry::new());
        let pool = Arc::new(PoolManager::new(profiles, CooldownConfig::default()));

        let orchestrator = Arc::new(Orchestrator::new(
            driver.clone(),
            tap,
            Duration::from_millis(10),
            Timers {
                first_byte: Duration::from_millis(50),
                escalation: Duration::from_millis(200),
                request_ceiling: Duration::from_secs(5),
            },
        ));

        AppState {
            pool,
            admission: Arc::new(Admission::new()),
            orchestrator,
            driver,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(10),
            },
            authority,
            leaf_cache,
            prometheus: test_prometheus_handle(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_pool_and_intercept() {
        let state = test_app_state(
            Arc::new(MockDriver::new()),
            vec![profile("primary/a", PoolBucket::Primary)],
        );
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded", "nothing active until first selection");
        assert_eq!(json["pool"]["buckets"][0]["bucket"], "primary");
        assert_eq!(json["intercept"]["root_generation"], 1);
        assert_eq!(json["intercept"]["cached_leaves"], 0);
    }

    #[tokio::test]
    async fn health_endpoint_503_when_pool_empty() {
        let state = test_app_state(Arc::new(MockDriver::new()), vec![]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_app_state(Arc::new(MockDriver::new()), vec![]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn completion_returns_retrieved_text() {
        let driver = Arc::new(
            MockDriver::new()
                .poll_sequence(vec![Ok(SubmissionStatus::Done)])
                .harvest_ok("the answer"),
        );
        let state = test_app_state(driver, vec![profile("primary/a", PoolBucket::Primary)]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/completions")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prompt":"hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["text"], "the answer");
        let request_id = json["request_id"].as_str().unwrap();
        assert!(request_id.starts_with("req_"));
    }

    #[tokio::test]
    async fn completion_with_empty_pool_returns_rotation_exhausted() {
        let state = test_app_state(Arc::new(MockDriver::new()), vec![]);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/completions")
                    .method("POST")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "rotation_exhausted");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
    }

    #[tokio::test]
    async fn completion_surfaces_retry_exhausted_after_403_burst() {
        // Every submission is rejected 403; each attempt cools its profile
        // until the budget is spent.
        let forbidden = || {
            Err(driver::Error::Backend {
                kind: FailureKind::Forbidden,
                message: "403".into(),
            })
        };
        let driver = Arc::new(
            MockDriver::new().submit_sequence(vec![forbidden(), forbidden(), forbidden()]),
        );
        let state = test_app_state(
            driver,
            vec![
                profile("primary/a", PoolBucket::Primary),
                profile("backup/b", PoolBucket::Backup),
                profile("emergency/c", PoolBucket::Emergency),
            ],
        );
        let pool = state.pool.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/completions")
                    .method("POST")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "retry_exhausted");

        // All three profiles ended up cooling.
        let snapshot = pool.snapshot().await;
        let cooling: u64 = (0..3)
            .map(|i| snapshot["buckets"][i]["cooling"].as_u64().unwrap())
            .sum();
        assert_eq!(cooling, 3);
    }
}
