//! Local HTTP health endpoint: `/healthz` liveness, `/readyz` readiness.
//!
//! Readiness reflects the stream state, the last stream error, collector
//! drop counters, WAL backlog, and any degraded config files, so operators
//! can see the cause of trouble without gateway access.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;

use crate::agent::apply::ConfigApplier;
use crate::agent::collector::TelemetryQueue;

/// Mutable health facts shared between the stream client and this endpoint.
#[derive(Debug, Default)]
pub struct AgentHealth {
    stream_state: Mutex<String>,
    last_error: Mutex<Option<String>>,
}

impl AgentHealth {
    pub fn new() -> Self {
        Self {
            stream_state: Mutex::new("idle".to_string()),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_stream_state(&self, state: &str) {
        *self.stream_state.lock().expect("health mutex poisoned") = state.to_string();
    }

    pub fn stream_state(&self) -> String {
        self.stream_state
            .lock()
            .expect("health mutex poisoned")
            .clone()
    }

    pub fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().expect("health mutex poisoned") = error;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .expect("health mutex poisoned")
            .clone()
    }
}

/// Everything the readiness probe reports on.
#[derive(Clone)]
pub struct HealthContext {
    pub health: Arc<AgentHealth>,
    pub queue: Arc<TelemetryQueue>,
    pub applier: Arc<ConfigApplier>,
}

#[derive(Serialize)]
struct ReadyReport {
    ready: bool,
    stream_state: String,
    last_error: Option<String>,
    dropped_records: u64,
    wal_backlog_bytes: u64,
    degraded_files: Vec<String>,
    version: &'static str,
}

/// Build the health router (separated from `serve` for tests).
pub fn router(ctx: HealthContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(ctx)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(ctx): State<HealthContext>) -> impl IntoResponse {
    let stream_state = ctx.health.stream_state();
    let ready = stream_state == "streaming";
    let report = ReadyReport {
        ready,
        stream_state,
        last_error: ctx.health.last_error(),
        dropped_records: ctx.queue.dropped_records(),
        wal_backlog_bytes: ctx.queue.wal().backlog_bytes(),
        degraded_files: ctx.applier.degraded_files(),
        version: crate::agent::update::VERSION,
    };
    let code = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// Bind `127.0.0.1:<port>` and serve until `shutdown` flips.
pub async fn serve(
    port: u16,
    ctx: HealthContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding health port {port}"))?;
    log::info!(
        "[Health] listening on {}",
        listener.local_addr().expect("bound listener has an address")
    );
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("health server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::apply::{ConfigApplier, ProxyControl};
    use crate::agent::backup::BackupRing;
    use crate::wal::WalBuffer;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> HealthContext {
        let wal = Arc::new(WalBuffer::open(&dir.path().join("buf")).unwrap());
        let control = ProxyControl {
            validate: vec!["true".into()],
            reload: vec!["true".into()],
            restart: vec!["true".into()],
            stop: vec!["true".into()],
        };
        HealthContext {
            health: Arc::new(AgentHealth::new()),
            queue: Arc::new(TelemetryQueue::new(wal, "a".into())),
            applier: Arc::new(ConfigApplier::new(
                control,
                BackupRing::new(dir.path().join("backups"), 10),
                dir.path(),
            )),
        }
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let (_tx, rx) = watch::channel(false);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut shutdown = rx;
        tokio::spawn(async move {
            axum::serve(listener, router(ctx))
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
                .unwrap();
        });

        let body = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .unwrap();
        assert!(body.status().is_success());
    }

    #[tokio::test]
    async fn test_readyz_reflects_stream_state() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let health = Arc::clone(&ctx.health);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(ctx)).await.unwrap();
        });

        let response = reqwest::get(format!("http://{addr}/readyz")).await.unwrap();
        assert_eq!(response.status(), 503);
        let report: serde_json::Value = response.json().await.unwrap();
        assert_eq!(report["ready"], false);
        assert_eq!(report["stream_state"], "idle");

        health.set_stream_state("streaming");
        let response = reqwest::get(format!("http://{addr}/readyz")).await.unwrap();
        assert_eq!(response.status(), 200);
        let report: serde_json::Value = response.json().await.unwrap();
        assert_eq!(report["ready"], true);
    }
}
