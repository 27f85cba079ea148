//! Liveness pings and bounded reconnection, one monitor per endpoint.
//!
//! ```text
//! Connected --ping fails--> Reconnecting --attempt ok--> Connected
//!                                |
//!                                +--attempts exhausted--> Failed
//! ```
//!
//! The monitor is the only writer of its endpoint's [`EndpointCell`]. The
//! data path reads the current handle through [`EndpointCell::load`] and
//! never sees a handle mid-replacement.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::HealthConfig;
use crate::stats::StatsLog;
use crate::{Error, Result};

/// Holds the usable connection handle for one endpoint.
pub struct EndpointCell<H> {
    current: ArcSwap<H>,
    generation: watch::Sender<u64>,
}

impl<H> EndpointCell<H> {
    pub fn new(handle: H) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(handle),
            generation,
        }
    }

    /// The handle in use right now.
    pub fn load(&self) -> Arc<H> {
        self.current.load_full()
    }

    /// Swaps in a fresh handle and bumps the generation.
    pub fn replace(&self, handle: H) {
        self.current.store(Arc::new(handle));
        self.generation.send_modify(|g| *g += 1);
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Notified on every [`replace`](Self::replace).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

/// A connection the monitor knows how to build and probe.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Builds a brand new connection, including any per-connection set-up.
    async fn connect(&self) -> Result<Self::Handle>;

    async fn ping(&self, handle: &Self::Handle) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Connected,
    Reconnecting,
    /// Terminal.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    pub status: EndpointStatus,
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl EndpointState {
    fn connected() -> Self {
        Self {
            status: EndpointStatus::Connected,
            attempt: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Bound on one connect-and-ping reconnect attempt.
    pub connect_timeout: Duration,
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
}

impl HealthPolicy {
    pub fn broker(config: &HealthConfig, connect_timeout: Duration) -> Self {
        Self::with_interval(config, config.broker_ping_interval_ms, connect_timeout)
    }

    pub fn influx(config: &HealthConfig, connect_timeout: Duration) -> Self {
        Self::with_interval(config, config.influx_ping_interval_ms, connect_timeout)
    }

    fn with_interval(config: &HealthConfig, interval_ms: u64, connect_timeout: Duration) -> Self {
        Self {
            ping_interval: Duration::from_millis(interval_ms),
            ping_timeout: config.ping_timeout(),
            connect_timeout,
            max_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// Connects and validates with a ping, bounded by `limit`.
pub async fn establish<E: Endpoint>(endpoint: &E, limit: Duration) -> Result<E::Handle> {
    let attempt = async {
        let handle = endpoint.connect().await?;
        endpoint.ping(&handle).await?;
        Ok::<_, Error>(handle)
    };
    timeout(limit, attempt).await.map_err(|_| Error::Timeout {
        message: format!("connecting to {} took longer than {:?}", endpoint.name(), limit),
    })?
}

pub struct HealthMonitor<E: Endpoint> {
    endpoint: E,
    cell: Arc<EndpointCell<E::Handle>>,
    policy: HealthPolicy,
    stats: StatsLog,
    state: watch::Sender<EndpointState>,
}

impl<E: Endpoint> HealthMonitor<E> {
    pub fn new(
        endpoint: E,
        cell: Arc<EndpointCell<E::Handle>>,
        policy: HealthPolicy,
        stats: StatsLog,
    ) -> Self {
        let (state, _) = watch::channel(EndpointState::connected());
        Self {
            endpoint,
            cell,
            policy,
            stats,
            state,
        }
    }

    /// Observes state transitions.
    pub fn state(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }

    /// Pings until the endpoint is lost for good.
    ///
    /// Only returns with [`Error::ReconnectExhausted`]; the caller decides
    /// how to end the process.
    pub async fn run(self) -> Result<()> {
        let period = self.policy.ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            endpoint = self.endpoint.name(),
            interval = ?period,
            "Health monitor started"
        );

        loop {
            ticker.tick().await;

            let handle = self.cell.load();
            match self.ping(&handle).await {
                Ok(()) => debug!(endpoint = self.endpoint.name(), "Ping ok"),
                Err(e) => {
                    drop(handle);
                    self.stats.ping_failed(self.endpoint.name(), &e);
                    self.reconnect(e).await?;
                    // Pinging resumes one full interval after recovery.
                    ticker.reset();
                }
            }
        }
    }

    async fn ping(&self, handle: &E::Handle) -> Result<()> {
        match timeout(self.policy.ping_timeout, self.endpoint.ping(handle)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Ping {
                endpoint: self.endpoint.name(),
                message: format!("no answer within {:?}", self.policy.ping_timeout),
            }),
        }
    }

    async fn reconnect(&self, cause: Error) -> Result<()> {
        let name = self.endpoint.name();
        let max = self.policy.max_attempts;
        let mut last_error = cause.to_string();

        for attempt in 1..=max {
            self.state.send_replace(EndpointState {
                status: EndpointStatus::Reconnecting,
                attempt,
                last_error: Some(last_error.clone()),
            });

            sleep(self.policy.reconnect_delay).await;

            match establish(&self.endpoint, self.policy.connect_timeout).await {
                Ok(handle) => {
                    self.cell.replace(handle);
                    self.state.send_replace(EndpointState::connected());
                    self.stats.reconnect_succeeded(name, attempt);
                    return Ok(());
                }
                Err(e) => {
                    self.stats.reconnect_failed(name, attempt, &e, attempt == max);
                    last_error = e.to_string();
                }
            }
        }

        self.state.send_replace(EndpointState {
            status: EndpointStatus::Failed,
            attempt: max,
            last_error: Some(last_error),
        });
        Err(Error::ReconnectExhausted {
            endpoint: name,
            attempts: max,
        })
    }
}
