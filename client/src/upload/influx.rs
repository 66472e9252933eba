//! InfluxDB v2 HTTP sink

use super::{Sink, SinkError};
use crate::config::InfluxConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use protocol::LineProtocolPoint;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct InfluxSink {
    client: reqwest::Client,
    base_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }

    fn write_url(&self) -> String {
        format!("{}/api/v2/write", self.base_url)
    }

    fn ping_url(&self) -> String {
        format!("{}/ping", self.base_url)
    }
}

/// Newline-separated body, one point per line
fn batch_body(points: &[LineProtocolPoint]) -> Result<String, SinkError> {
    let mut body = String::new();
    for point in points {
        let line = point
            .to_line()
            .map_err(|e| SinkError::Invalid(e.to_string()))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}

fn transport_error(e: reqwest::Error) -> SinkError {
    if e.is_connect() || e.is_timeout() {
        SinkError::Unavailable(e.to_string())
    } else {
        SinkError::Transport(e.to_string())
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write_batch(&self, points: &[LineProtocolPoint]) -> Result<(), SinkError> {
        let body = batch_body(points)?;
        debug!("Writing {} points to {}", points.len(), self.base_url);

        let response = self
            .client
            .post(self.write_url())
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn ping(&self) -> bool {
        match self.client.get(self.ping_url()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Influx ping failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_strip_trailing_slash() {
        let sink = InfluxSink::new(&InfluxConfig {
            enabled: true,
            url: "http://influx.local:8086/".to_string(),
            org: "omnt".to_string(),
            bucket: "omnt".to_string(),
            token: "secret".to_string(),
        })
        .unwrap();
        assert_eq!(sink.write_url(), "http://influx.local:8086/api/v2/write");
        assert_eq!(sink.ping_url(), "http://influx.local:8086/ping");
    }

    #[test]
    fn test_batch_body() {
        let points = vec![
            LineProtocolPoint::new("Ping").field("rtt", 1.5).time_ms(1000),
            LineProtocolPoint::new("Ping").field("rtt", 2.5).time_ms(2000),
        ];
        assert_eq!(
            batch_body(&points).unwrap(),
            "Ping rtt=1.5 1000\nPing rtt=2.5 2000\n"
        );

        let invalid = vec![LineProtocolPoint::new("Ping")];
        assert!(matches!(batch_body(&invalid), Err(SinkError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_pings_false() {
        let sink = InfluxSink::new(&InfluxConfig {
            enabled: true,
            // reserved port on loopback, nothing listens there
            url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(!sink.ping().await);
    }
}
