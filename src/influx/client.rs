use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use super::batch::PointSink;
use super::line_protocol::{encode_batch, Point};
use crate::config::InfluxConfig;
use crate::{Error, Result};

/// Minimal InfluxDB 1.x HTTP client: `/ping` and `/write`.
#[derive(Debug, Clone)]
pub struct InfluxClient {
    http: Client,
    url: String,
    database: String,
    retention_policy: String,
    username: Option<String>,
    password: Option<String>,
}

impl InfluxClient {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            retention_policy: config.retention_policy.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn ping(&self) -> Result<()> {
        let response = self.http.get(format!("{}/ping", self.url)).send().await?;

        if !response.status().is_success() {
            return Err(Error::Ping {
                endpoint: "influxdb",
                message: format!("/ping returned status {}", response.status()),
            });
        }
        Ok(())
    }

    /// Writes already encoded lines with nanosecond precision.
    pub async fn write(&self, body: String) -> Result<()> {
        let mut request = self
            .http
            .post(format!("{}/write", self.url))
            .query(&[
                ("db", self.database.as_str()),
                ("rp", self.retention_policy.as_str()),
                ("precision", "ns"),
            ])
            .body(body);

        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Connection(format!(
                "/write returned status {}: {}",
                status,
                detail.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PointSink for InfluxClient {
    async fn write_points(&self, points: &[Point]) -> Result<()> {
        debug!(points = points.len(), database = %self.database, "Writing batch");
        self.write(encode_batch(points)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> InfluxConfig {
        InfluxConfig {
            url: url.to_string(),
            database: "telemetry".to_string(),
            username: None,
            password: None,
            retention_policy: "autogen".to_string(),
            points_to_flush: 10,
            millis_to_flush: 100,
            max_pending_points: 100,
            request_timeout_secs: 1,
        }
    }

    #[test]
    fn test_trailing_slash_is_dropped() {
        let client = InfluxClient::new(&config("http://localhost:8086/")).unwrap();
        assert_eq!(client.url, "http://localhost:8086");
    }

    #[tokio::test]
    async fn test_ping_unreachable_fails() {
        // Port 9 (discard) is closed on test machines.
        let client = InfluxClient::new(&config("http://127.0.0.1:9")).unwrap();
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires running InfluxDB
    async fn test_ping_live() {
        let client = InfluxClient::new(&config("http://localhost:8086")).unwrap();
        client.ping().await.unwrap();
    }
}
