use std::future::IntoFuture;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::{ApiListener, BoxError};

/// Route served by `HealthListener::default()`.
pub const DEFAULT_HEALTH_PATH: &str = "/api/health";

/// Supplies the application part of a health report.
#[async_trait]
pub trait HealthCheck
where
    Self: Send + Sync + 'static,
{
    /// Current health payload. An error reports the instance unhealthy.
    async fn check(&self) -> std::result::Result<Value, BoxError>;
}

#[derive(Clone)]
struct Report {
    info: Value,
    check: Option<Arc<dyn HealthCheck>>,
}

async fn report(State(report): State<Report>) -> (StatusCode, Json<Value>) {
    let Some(check) = &report.check else {
        return (
            StatusCode::OK,
            Json(json!({ "info": report.info, "payload": Value::Null })),
        );
    };

    match check.check().await {
        Ok(payload) => (
            StatusCode::OK,
            Json(json!({ "info": report.info, "payload": payload })),
        ),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "info": report.info, "error": e.to_string() })),
            )
        }
    }
}

/// An `ApiListener` that only answers `GET <path>` with a JSON health report.
///
/// The report carries the static `info` document and the check's payload.
/// Other paths get 404 and other methods 405.
pub struct HealthListener {
    path: String,
    report: Report,
    shutdown: Mutex<CancellationToken>,
    task_tracker: TaskTracker,
}

impl HealthListener {
    /// Creates a listener serving the report on `path`.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };

        Self {
            path,
            report: Report {
                info: Value::Null,
                check: None,
            },
            shutdown: Mutex::new(CancellationToken::new()),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Asks `check` for the payload of every report.
    #[must_use]
    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.report.check = Some(check);
        self
    }

    /// Includes `info` in every report.
    #[must_use]
    pub fn with_info(mut self, info: Value) -> Self {
        self.report.info = info;
        self
    }

    /// The route the report is served on.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Default for HealthListener {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_PATH)
    }
}

#[async_trait]
impl ApiListener for HealthListener {
    async fn start(&self, listener: TcpListener) -> std::result::Result<bool, BoxError> {
        let router = Router::new()
            .route(&self.path, get(report))
            .with_state(self.report.clone());

        let shutdown_token = CancellationToken::new();
        *self.shutdown.lock() = shutdown_token.clone();
        self.task_tracker.reopen();

        self.task_tracker.spawn(async move {
            tokio::select! {
                result = axum::serve(listener, router).into_future() => {
                    if let Err(e) = result {
                        warn!(error = %e, "health server exited");
                    }
                }
                () = shutdown_token.cancelled() => {}
            }
        });
        info!(path = %self.path, "health endpoint serving");

        Ok(true)
    }

    async fn close(&self) -> std::result::Result<bool, BoxError> {
        self.shutdown.lock().cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        info!(path = %self.path, "health endpoint closed");

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Api, CloseOutcome, StartOutcome};

    use assert_matches::assert_matches;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Queue(std::result::Result<u32, &'static str>);

    #[async_trait]
    impl HealthCheck for Queue {
        async fn check(&self) -> std::result::Result<Value, BoxError> {
            let depth = self.0?;
            Ok(json!({ "queue": depth }))
        }
    }

    async fn request(addr: SocketAddr, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let head = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(head.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn serve(listener: HealthListener) -> Api {
        let api = Api::new("health", Arc::new(listener))
            .with_host(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_matches!(api.start(&[]).await, Ok(StartOutcome::Started));
        api
    }

    #[tokio::test]
    async fn test_health_report() {
        let api = serve(
            HealthListener::new("api/health")
                .with_check(Arc::new(Queue(Ok(3))))
                .with_info(json!({ "name": "svc" })),
        )
        .await;
        let addr = api.local_addr().unwrap();

        let response = request(addr, "GET", "/api/health").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains(r#""queue":3"#), "{response}");
        assert!(response.contains(r#""name":"svc""#), "{response}");

        assert!(request(addr, "GET", "/other").await.starts_with("HTTP/1.1 404"));
        assert!(request(addr, "POST", "/api/health").await.starts_with("HTTP/1.1 405"));

        assert_matches!(api.close().await, Ok(CloseOutcome::Closed));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_check_is_unavailable() {
        let api = serve(HealthListener::default().with_check(Arc::new(Queue(Err("stalled"))))).await;

        let response = request(api.local_addr().unwrap(), "GET", DEFAULT_HEALTH_PATH).await;

        assert!(response.starts_with("HTTP/1.1 503"), "{response}");
        assert!(response.contains("stalled"), "{response}");
        api.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_close() {
        let api = serve(HealthListener::default()).await;
        api.close().await.unwrap();

        assert_matches!(api.start(&[]).await, Ok(StartOutcome::Started));
        let response = request(api.local_addr().unwrap(), "GET", DEFAULT_HEALTH_PATH).await;
        assert!(response.contains(r#""payload":null"#), "{response}");
        api.close().await.unwrap();
    }
}
