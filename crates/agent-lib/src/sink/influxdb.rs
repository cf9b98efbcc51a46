//! Time-series database sink writing the InfluxDB line protocol

use super::{Sink, SinkError, SinkFactory, SinkOptions};
use crate::models::ContainerStats;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxDbOptions {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_address() -> String {
    "http://localhost:8086".to_string()
}

fn default_database() -> String {
    "statspout".to_string()
}

impl Default for InfluxDbOptions {
    fn default() -> Self {
        Self {
            address: default_address(),
            database: default_database(),
        }
    }
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes one point per measurement for every sample
pub struct InfluxDbSink {
    client: reqwest::Client,
    write_url: Url,
}

impl InfluxDbSink {
    pub fn new(options: &InfluxDbOptions) -> Result<Self, SinkError> {
        let invalid = |reason: String| SinkError::InvalidOptions {
            sink: "influxdb",
            reason,
        };

        if options.database.is_empty() {
            return Err(invalid("database must not be empty".to_string()));
        }

        let mut write_url = Url::parse(&options.address)
            .and_then(|base| base.join("write"))
            .map_err(|err| invalid(format!("address `{}`: {}", options.address, err)))?;
        write_url
            .query_pairs_mut()
            .append_pair("db", &options.database)
            .append_pair("precision", "s");

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { client, write_url })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

/// Escape a tag value: commas, spaces and equals signs must be backslashed
fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | ' ' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Line-protocol body for one sample
pub fn render_lines(stats: &ContainerStats) -> String {
    let tag = escape_tag(&stats.container_name);
    let ts = stats.timestamp.timestamp();
    let mut body = String::new();

    let floats = [
        ("cpu_usage", stats.cpu_percent),
        ("mem_usage", stats.memory_percent),
    ];
    for (measurement, value) in floats {
        let _ = writeln!(body, "{},container={} value={} {}", measurement, tag, value, ts);
    }

    let integers = [
        ("mem_usage_bytes", stats.memory_usage_bytes),
        ("tx_bytes", stats.tx_bytes_total),
        ("rx_bytes", stats.rx_bytes_total),
    ];
    for (measurement, value) in integers {
        let _ = writeln!(body, "{},container={} value={}i {}", measurement, tag, value, ts);
    }

    body
}

#[async_trait]
impl Sink for InfluxDbSink {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    async fn push(&self, stats: &ContainerStats) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.write_url.clone())
            .body(render_lines(stats))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }
        Ok(())
    }

    async fn clear(&self, container_name: &str) {
        // Stored history stays; the series simply stops receiving points
        debug!(container = %container_name, "Series left in place");
    }

    async fn close(&self) {}
}

pub struct InfluxDbFactory;

#[async_trait]
impl SinkFactory for InfluxDbFactory {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    async fn create(&self, options: &SinkOptions) -> Result<Arc<dyn Sink>, SinkError> {
        Ok(Arc::new(InfluxDbSink::new(&options.influxdb)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, http::StatusCode, routing::post, Router};
    use chrono::TimeZone;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn sample(name: &str) -> ContainerStats {
        ContainerStats {
            container_name: name.to_string(),
            timestamp: chrono::Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            cpu_percent: 12.5,
            memory_percent: 50.0,
            memory_usage_bytes: 512,
            tx_bytes_total: 125,
            rx_bytes_total: 60,
        }
    }

    #[test]
    fn test_render_lines() {
        let body = render_lines(&sample("web"));
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(
            lines,
            vec![
                "cpu_usage,container=web value=12.5 1704164645",
                "mem_usage,container=web value=50 1704164645",
                "mem_usage_bytes,container=web value=512i 1704164645",
                "tx_bytes,container=web value=125i 1704164645",
                "rx_bytes,container=web value=60i 1704164645",
            ]
        );
    }

    #[test]
    fn test_escape_tag() {
        assert_eq!(escape_tag("my app,v=1"), "my\\ app\\,v\\=1");
    }

    #[test]
    fn test_write_url() {
        let sink = InfluxDbSink::new(&InfluxDbOptions::default()).unwrap();
        assert_eq!(
            sink.write_url().as_str(),
            "http://localhost:8086/write?db=statspout&precision=s"
        );
    }

    #[test]
    fn test_invalid_options() {
        let options = InfluxDbOptions {
            address: "not a url".to_string(),
            database: "db".to_string(),
        };
        assert!(matches!(
            InfluxDbSink::new(&options),
            Err(SinkError::InvalidOptions { .. })
        ));

        let options = InfluxDbOptions {
            database: String::new(),
            ..InfluxDbOptions::default()
        };
        assert!(InfluxDbSink::new(&options).is_err());
    }

    async fn fake_influx(status: StatusCode) -> (String, mpsc::UnboundedReceiver<(HashMap<String, String>, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/write",
            post(move |Query(query): Query<HashMap<String, String>>, body: String| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((query, body));
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (address, rx)
    }

    #[tokio::test]
    async fn test_push_writes_points() {
        let (address, mut writes) = fake_influx(StatusCode::NO_CONTENT).await;
        let sink = InfluxDbSink::new(&InfluxDbOptions {
            address,
            database: "spout".to_string(),
        })
        .unwrap();

        sink.push(&sample("web")).await.unwrap();

        let (query, body) = writes.recv().await.unwrap();
        assert_eq!(query["db"], "spout");
        assert_eq!(query["precision"], "s");
        assert_eq!(body.lines().count(), 5);
    }

    #[tokio::test]
    async fn test_push_rejected() {
        let (address, _writes) = fake_influx(StatusCode::BAD_REQUEST).await;
        let sink = InfluxDbSink::new(&InfluxDbOptions {
            address,
            database: "spout".to_string(),
        })
        .unwrap();

        let err = sink.push(&sample("web")).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected { status, .. } if status.as_u16() == 400));
    }
}
