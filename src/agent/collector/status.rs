//! Proxy status-endpoint scrape.
//!
//! The endpoint returns either the classic plain-text stub status page or a
//! JSON document with a `connections` object and optional per-zone counters.
//! Both are normalized into a [`ProxyMetric`].

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::proto::{ProxyMetric, ZoneMetric};

/// Fetch and parse the status endpoint once.
///
/// # Errors
///
/// Returns an error on connect failure, non-2xx status, or a body that
/// matches neither format. The caller logs and skips the sample.
pub async fn scrape(client: &reqwest::Client, url: &str) -> Result<ProxyMetric> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("requesting {url}"))?;
    if !response.status().is_success() {
        bail!("status endpoint returned {}", response.status());
    }
    let body = response.text().await.context("reading status body")?;
    parse_status_body(&body)
}

/// Parse either supported status format.
pub fn parse_status_body(body: &str) -> Result<ProxyMetric> {
    let trimmed = body.trim_start();
    let mut metric = if trimmed.starts_with('{') {
        parse_json_status(trimmed)?
    } else {
        parse_stub_status(body)?
    };
    metric.ts_unix = Utc::now().timestamp();
    Ok(metric)
}

/// Plain-text stub page:
///
/// ```text
/// Active connections: 291
/// server accepts handled requests
///  16630948 16630948 31070465
/// Reading: 6 Writing: 179 Waiting: 106
/// ```
fn parse_stub_status(body: &str) -> Result<ProxyMetric> {
    let mut metric = ProxyMetric::default();
    let mut lines = body.lines();

    let active_line = lines.next().context("empty status body")?;
    metric.active = active_line
        .strip_prefix("Active connections:")
        .and_then(|rest| rest.trim().parse().ok())
        .context("malformed Active connections line")?;

    // Skip the "server accepts handled requests" header.
    lines.next().context("truncated status body")?;

    let counters = lines.next().context("truncated status body")?;
    let mut fields = counters.split_whitespace();
    metric.accepted = next_u64(&mut fields).context("missing accepts counter")?;
    metric.handled = next_u64(&mut fields).context("missing handled counter")?;
    metric.requests = next_u64(&mut fields).context("missing requests counter")?;

    let states = lines.next().context("truncated status body")?;
    let mut tokens = states.split_whitespace();
    while let Some(token) = tokens.next() {
        let value = tokens.next().and_then(|v| v.parse::<u64>().ok());
        match token {
            "Reading:" => metric.reading = value.context("missing Reading value")?,
            "Writing:" => metric.writing = value.context("missing Writing value")?,
            "Waiting:" => metric.waiting = value.context("missing Waiting value")?,
            _ => {}
        }
    }

    Ok(metric)
}

/// JSON status document (commercial API shape):
///
/// ```json
/// { "connections": {"active": 3, "accepted": 9, "handled": 9, "requests": 21,
///                   "reading": 0, "writing": 1, "waiting": 2},
///   "server_zones": {"web": {"responses": {"1xx":0,"2xx":17,...}}} }
/// ```
fn parse_json_status(body: &str) -> Result<ProxyMetric> {
    let value: serde_json::Value =
        serde_json::from_str(body).context("parsing JSON status body")?;
    let connections = value
        .get("connections")
        .context("JSON status missing connections object")?;

    let field = |name: &str| -> u64 {
        connections
            .get(name)
            .and_then(|v| v.as_u64())
            .unwrap_or_default()
    };

    let mut metric = ProxyMetric {
        active: field("active"),
        accepted: field("accepted"),
        handled: field("handled"),
        requests: connections
            .get("requests")
            .or_else(|| value.get("requests").and_then(|r| r.get("total")))
            .and_then(|v| v.as_u64())
            .unwrap_or_default(),
        reading: field("reading"),
        writing: field("writing"),
        waiting: field("waiting"),
        ..ProxyMetric::default()
    };

    if let Some(zones) = value.get("server_zones").and_then(|z| z.as_object()) {
        let mut parsed: Vec<ZoneMetric> = zones
            .iter()
            .map(|(name, zone)| {
                let responses = zone.get("responses");
                let class = |key: &str| -> u64 {
                    responses
                        .and_then(|r| r.get(key))
                        .and_then(|v| v.as_u64())
                        .unwrap_or_default()
                };
                ZoneMetric {
                    name: name.clone(),
                    responses_1xx: class("1xx"),
                    responses_2xx: class("2xx"),
                    responses_3xx: class("3xx"),
                    responses_4xx: class("4xx"),
                    responses_5xx: class("5xx"),
                }
            })
            .collect();
        parsed.sort_by(|a, b| a.name.cmp(&b.name));
        metric.zones = Some(parsed);
    }

    Ok(metric)
}

fn next_u64<'a>(fields: &mut impl Iterator<Item = &'a str>) -> Option<u64> {
    fields.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUB: &str = "Active connections: 291\n\
server accepts handled requests\n\
 16630948 16630948 31070465\n\
Reading: 6 Writing: 179 Waiting: 106\n";

    #[test]
    fn test_stub_status_parses() {
        let metric = parse_status_body(STUB).unwrap();
        assert_eq!(metric.active, 291);
        assert_eq!(metric.accepted, 16_630_948);
        assert_eq!(metric.handled, 16_630_948);
        assert_eq!(metric.requests, 31_070_465);
        assert_eq!(metric.reading, 6);
        assert_eq!(metric.writing, 179);
        assert_eq!(metric.waiting, 106);
        assert!(metric.zones.is_none());
    }

    #[test]
    fn test_json_status_parses_with_zones() {
        let body = r#"{
            "connections": {"active": 3, "accepted": 9, "handled": 9,
                            "requests": 21, "reading": 0, "writing": 1, "waiting": 2},
            "server_zones": {
                "web": {"responses": {"1xx": 0, "2xx": 17, "3xx": 2, "4xx": 1, "5xx": 1}},
                "api": {"responses": {"2xx": 40}}
            }
        }"#;
        let metric = parse_status_body(body).unwrap();
        assert_eq!(metric.active, 3);
        assert_eq!(metric.requests, 21);
        let zones = metric.zones.unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].name, "api");
        assert_eq!(zones[0].responses_2xx, 40);
        assert_eq!(zones[1].name, "web");
        assert_eq!(zones[1].responses_5xx, 1);
    }

    #[test]
    fn test_malformed_body_is_an_error() {
        assert!(parse_status_body("<html>404</html>").is_err());
        assert!(parse_status_body("{\"unexpected\": true}").is_err());
        assert!(parse_status_body("").is_err());
    }

    #[tokio::test]
    async fn test_scrape_against_wiremock() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string(STUB))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let metric = scrape(&client, &format!("{}/status", server.uri()))
            .await
            .unwrap();
        assert_eq!(metric.active, 291);
    }

    #[tokio::test]
    async fn test_scrape_5xx_is_an_error() {
        use wiremock::matchers::any;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(scrape(&client, &server.uri()).await.is_err());
    }
}
