#![allow(dead_code)]

use amqp_influx::amqp::RawSink;
use amqp_influx::config::{BrokerConfig, Config, InfluxConfig, ParserConfig, StatsConfig};
use amqp_influx::{Error, Result};
use async_trait::async_trait;
use std::env;
use std::sync::Mutex;

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let broker = BrokerConfig {
        host: env::var("TEST_AMQP_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_AMQP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5672),
        username: env::var("TEST_AMQP_USERNAME").unwrap_or_else(|_| "guest".to_string()),
        password: env::var("TEST_AMQP_PASSWORD").unwrap_or_else(|_| "guest".to_string()),
        virtual_host: env::var("TEST_AMQP_VHOST").unwrap_or_else(|_| "/".to_string()),
        queue: format!("test_metrics_{}", std::process::id()),
        backup_queue: Some(format!("test_metrics_backup_{}", std::process::id())),
        error_queue: Some(format!("test_metrics_error_{}", std::process::id())),
        consumer_tag: format!("test_{}", std::process::id()),
        connect_timeout_secs: 10,
    };

    let influx = InfluxConfig {
        url: env::var("TEST_INFLUX_URL").unwrap_or_else(|_| "http://localhost:8086".to_string()),
        database: env::var("TEST_INFLUX_DATABASE").unwrap_or_else(|_| "amqp_influx_test".to_string()),
        username: env::var("TEST_INFLUX_USERNAME").ok(),
        password: env::var("TEST_INFLUX_PASSWORD").ok(),
        retention_policy: "autogen".to_string(),
        points_to_flush: 1, // Write every point immediately
        millis_to_flush: 100,
        max_pending_points: 1_000,
        request_timeout_secs: 5,
    };

    Config {
        broker,
        influx,
        health: Default::default(),
        parser: ParserConfig {
            infer_timestamp_unit: true,
            ..Default::default()
        },
        stats: StatsConfig {
            enabled: false,
            interval_ms: 1000,
        },
    }
}

/// Records every republished body per queue.
#[derive(Default)]
pub struct RecordingSink {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub refuse: Option<String>,
}

impl RecordingSink {
    pub fn bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl RawSink for RecordingSink {
    async fn republish(&self, queue: &str, body: &[u8]) -> Result<()> {
        if self.refuse.as_deref() == Some(queue) {
            return Err(Error::Connection(format!("{} is unavailable", queue)));
        }
        self.published
            .lock()
            .unwrap()
            .push((queue.to_string(), body.to_vec()));
        Ok(())
    }
}
