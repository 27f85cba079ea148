use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::parser::{ParserKind, TimestampUnit};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub broker: BrokerConfig,
    pub influx: InfluxConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_guest")]
    pub username: String,
    #[serde(default = "default_guest")]
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    pub queue: String,
    #[serde(default)]
    pub backup_queue: Option<String>,
    #[serde(default)]
    pub error_queue: Option<String>,
    #[serde(default = "default_consumer_tag")]
    pub consumer_tag: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_retention_policy")]
    pub retention_policy: String,
    #[serde(default = "default_points_to_flush")]
    pub points_to_flush: usize,
    #[serde(default = "default_millis_to_flush")]
    pub millis_to_flush: u64,
    /// Points allowed to wait for the batch writer before new ones are
    /// rejected.
    #[serde(default = "default_max_pending_points")]
    pub max_pending_points: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub broker_ping_interval_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub influx_ping_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParserConfig {
    #[serde(default)]
    pub format: ParserKind,
    #[serde(default)]
    pub infer_timestamp_unit: bool,
    #[serde(default = "default_unit")]
    pub default_unit: TimestampUnit,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stats_interval_ms")]
    pub interval_ms: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("AMQP_INFLUX")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Rejects values the bridge cannot run with. Called once, before any
    /// connection is attempted.
    pub fn validate(&self) -> Result<()> {
        let broker = &self.broker;
        if broker.queue.trim().is_empty() {
            return Err(Error::Config("broker.queue must not be empty".to_string()));
        }
        for (name, side) in [
            ("backup_queue", &broker.backup_queue),
            ("error_queue", &broker.error_queue),
        ] {
            match side.as_deref() {
                Some(q) if q.trim().is_empty() => {
                    return Err(Error::Config(format!("broker.{} must not be empty", name)));
                }
                Some(q) if q == broker.queue => {
                    return Err(Error::Config(format!(
                        "broker.{} must differ from the source queue '{}'",
                        name, broker.queue
                    )));
                }
                _ => {}
            }
        }

        if self.influx.url.trim().is_empty() {
            return Err(Error::Config("influx.url must not be empty".to_string()));
        }
        if self.influx.database.trim().is_empty() {
            return Err(Error::Config("influx.database must not be empty".to_string()));
        }
        if self.influx.points_to_flush == 0 || self.influx.millis_to_flush == 0 {
            return Err(Error::Config(
                "influx.points_to_flush and influx.millis_to_flush must be positive".to_string(),
            ));
        }
        if self.influx.max_pending_points < self.influx.points_to_flush {
            return Err(Error::Config(
                "influx.max_pending_points must be at least influx.points_to_flush".to_string(),
            ));
        }

        let health = &self.health;
        if health.broker_ping_interval_ms == 0 || health.influx_ping_interval_ms == 0 {
            return Err(Error::Config("ping intervals must be positive".to_string()));
        }
        if health.max_reconnect_attempts == 0 {
            return Err(Error::Config(
                "health.max_reconnect_attempts must be at least 1".to_string(),
            ));
        }

        if self.stats.enabled && self.stats.interval_ms == 0 {
            return Err(Error::Config("stats.interval_ms must be positive".to_string()));
        }

        Ok(())
    }

    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoded(&self.broker.username),
            urlencoded(&self.broker.password),
            self.broker.host,
            self.broker.port,
            urlencoded(&self.broker.virtual_host)
        )
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl InfluxConfig {
    pub fn flush_after(&self) -> Duration {
        Duration::from_millis(self.millis_to_flush)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl HealthConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            broker_ping_interval_ms: default_ping_interval_ms(),
            influx_ping_interval_ms: default_ping_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            format: ParserKind::default(),
            infer_timestamp_unit: false,
            default_unit: default_unit(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_stats_interval_ms(),
        }
    }
}

// Percent-encodes everything outside the RFC 3986 unreserved set, so
// credentials and the vhost survive as single URI components.
fn urlencoded(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02x}", byte)),
        }
    }
    out
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_consumer_tag() -> String {
    "amqp-influx".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_retention_policy() -> String {
    "autogen".to_string()
}

fn default_points_to_flush() -> usize {
    1000
}

fn default_millis_to_flush() -> u64 {
    5000
}

fn default_max_pending_points() -> usize {
    10_000
}

fn default_request_timeout() -> u64 {
    10
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

fn default_max_reconnect_attempts() -> u32 {
    4
}

fn default_reconnect_delay_ms() -> u64 {
    15_000
}

fn default_ping_timeout_ms() -> u64 {
    5_000
}

fn default_unit() -> TimestampUnit {
    TimestampUnit::Nanos
}

fn default_true() -> bool {
    true
}

fn default_stats_interval_ms() -> u64 {
    5_000
}
