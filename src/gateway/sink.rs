//! Downstream sinks for normalized telemetry batches.
//!
//! The ingest pipeline only knows the narrow [`BatchSink`] trait, so the
//! analytical store can be swapped without touching ingest. Writes are
//! expected to be idempotent on `(agent_id, sequence)` on the store side.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;

/// One normalized telemetry row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestRow {
    pub agent_id: String,
    pub sequence: u64,
    /// The envelope payload without its tag.
    pub body: serde_json::Value,
}

/// Narrow seam to the analytical store (or any alternative backend).
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Write one batch of a single kind. Implementations should be
    /// idempotent on `(agent_id, sequence)`.
    async fn write(&self, kind: &str, batch: &[IngestRow]) -> Result<()>;
}

/// JSON-lines POST to `<base>/ingest/<kind>`.
pub struct HttpSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSink {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BatchSink for HttpSink {
    async fn write(&self, kind: &str, batch: &[IngestRow]) -> Result<()> {
        let mut body = String::new();
        for row in batch {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }
        let url = format!("{}/ingest/{kind}", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .with_context(|| format!("posting batch to {url}"))?;
        if !response.status().is_success() {
            bail!("store returned {} for {url}", response.status());
        }
        Ok(())
    }
}

/// In-memory sink for tests and single-binary development.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<HashMap<String, Vec<IngestRow>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows written under `kind` so far.
    pub fn rows(&self, kind: &str) -> Vec<IngestRow> {
        self.rows
            .lock()
            .expect("memory sink mutex poisoned")
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Total row count across kinds.
    pub fn total(&self) -> usize {
        self.rows
            .lock()
            .expect("memory sink mutex poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn write(&self, kind: &str, batch: &[IngestRow]) -> Result<()> {
        self.rows
            .lock()
            .expect("memory sink mutex poisoned")
            .entry(kind.to_string())
            .or_default()
            .extend_from_slice(batch);
        Ok(())
    }
}

/// Discards everything (store sink disabled).
pub struct NullSink;

#[async_trait]
impl BatchSink for NullSink {
    async fn write(&self, _kind: &str, _batch: &[IngestRow]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(agent: &str, sequence: u64) -> IngestRow {
        IngestRow {
            agent_id: agent.to_string(),
            sequence,
            body: serde_json::json!({"status": 200}),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_accumulates_by_kind() {
        let sink = MemorySink::new();
        sink.write("log_record", &[row("a", 1), row("a", 2)])
            .await
            .unwrap();
        sink.write("proxy_metric", &[row("a", 3)]).await.unwrap();

        assert_eq!(sink.rows("log_record").len(), 2);
        assert_eq!(sink.rows("proxy_metric").len(), 1);
        assert_eq!(sink.total(), 3);
    }

    #[tokio::test]
    async fn test_http_sink_posts_ndjson() {
        use wiremock::matchers::{body_string_contains, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest/log_record"))
            .and(header("Content-Type", "application/x-ndjson"))
            .and(body_string_contains(r#""sequence":7"#))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(server.uri());
        sink.write("log_record", &[row("web-01", 7)]).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_sink_5xx_is_an_error() {
        use wiremock::matchers::any;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = HttpSink::new(server.uri());
        assert!(sink.write("log_record", &[row("a", 1)]).await.is_err());
    }
}
