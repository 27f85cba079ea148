//! Windowed counters and the diagnostics event contract.
//!
//! Components report discrete events through a [`StatsLog`]. Each event
//! updates one of four windowed counters and is forwarded to the configured
//! [`DiagnosticsSink`]. A periodic task drains the counters and hands the
//! window totals to the sink as a summary.
//!
//! # Example
//!
//! ```rust
//! use amqp_influx::stats::StatsLog;
//!
//! let stats = StatsLog::silent();
//! stats.message_read();
//! stats.message_read();
//! stats.point_written();
//!
//! let window = stats.counters().drain();
//! assert_eq!(window.read, 2);
//! assert_eq!(window.written, 1);
//! assert_eq!(stats.counters().drain().read, 0);
//! ```

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, trace, warn};

use crate::parser::ParseError;
use crate::Error;

/// The four counters reset on every drain.
#[derive(Debug, Default)]
pub struct Counters {
    read: AtomicU64,
    backed_up: AtomicU64,
    errored: AtomicU64,
    written: AtomicU64,
}

/// Totals for one window, taken by [`Counters::drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub read: u64,
    pub backed_up: u64,
    pub errored: u64,
    pub written: u64,
    pub taken_at: DateTime<Utc>,
}

impl Counters {
    /// Reads and zeroes every counter.
    ///
    /// Each counter is swapped on its own, so an increment racing the drain
    /// lands in exactly one window.
    pub fn drain(&self) -> CounterSnapshot {
        CounterSnapshot {
            read: self.read.swap(0, Ordering::Relaxed),
            backed_up: self.backed_up.swap(0, Ordering::Relaxed),
            errored: self.errored.swap(0, Ordering::Relaxed),
            written: self.written.swap(0, Ordering::Relaxed),
            taken_at: Utc::now(),
        }
    }
}

/// Receives diagnostic events. Every method defaults to a no-op.
pub trait DiagnosticsSink: Send + Sync {
    fn message_read(&self) {}

    fn message_backed_up(&self) {}

    /// A message failed to parse. `routed` tells whether it reached the
    /// error queue.
    fn message_errored(&self, _raw: &str, _error: &ParseError, _routed: bool) {}

    fn point_written(&self) {}

    fn ping_failed(&self, _endpoint: &'static str, _error: &Error) {}

    fn reconnect_succeeded(&self, _endpoint: &'static str, _attempt: u32) {}

    /// `last` is set on the final permitted attempt.
    fn reconnect_failed(&self, _endpoint: &'static str, _attempt: u32, _error: &Error, _last: bool) {}

    fn summary(&self, _window: &CounterSnapshot) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DiagnosticsSink for NoopSink {}

/// Writes events through `tracing`, escalating severity with the failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn message_read(&self) {
        trace!("Message read");
    }

    fn message_backed_up(&self) {
        trace!("Message copied to backup queue");
    }

    fn message_errored(&self, raw: &str, error: &ParseError, routed: bool) {
        warn!(
            payload = %raw,
            reason = %error.reason,
            fragment = %error.fragment,
            moved_to_error_queue = routed,
            "Erroneous payload"
        );
    }

    fn point_written(&self) {
        trace!("Point accepted for writing");
    }

    fn ping_failed(&self, endpoint: &'static str, error: &Error) {
        error!(endpoint, error = %error, "Lost connection");
    }

    fn reconnect_succeeded(&self, endpoint: &'static str, attempt: u32) {
        info!(endpoint, attempt, "Successfully reconnected");
    }

    fn reconnect_failed(&self, endpoint: &'static str, attempt: u32, error: &Error, last: bool) {
        if last {
            error!(endpoint, attempt, error = %error, "Could not reconnect, giving up");
        } else {
            warn!(endpoint, attempt, error = %error, "Could not reconnect");
        }
    }

    fn summary(&self, window: &CounterSnapshot) {
        if window.errored == 0 {
            info!(
                "read: {}, backed: {}, written: {}, errors: 0",
                window.read, window.backed_up, window.written
            );
        } else {
            info!(
                "read: {}, backed: {}, written: {}, ERRORS: {}",
                window.read, window.backed_up, window.written, window.errored
            );
        }
    }
}

/// Shared handle to the counters and the sink. Cheap to clone.
#[derive(Clone)]
pub struct StatsLog {
    counters: Arc<Counters>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl StatsLog {
    pub fn new(sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            sink,
        }
    }

    /// Events only update the counters.
    pub fn silent() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn message_read(&self) {
        self.counters.read.fetch_add(1, Ordering::Relaxed);
        self.sink.message_read();
    }

    pub fn message_backed_up(&self) {
        self.counters.backed_up.fetch_add(1, Ordering::Relaxed);
        self.sink.message_backed_up();
    }

    pub fn message_errored(&self, raw: &str, error: &ParseError, routed: bool) {
        self.counters.errored.fetch_add(1, Ordering::Relaxed);
        self.sink.message_errored(raw, error, routed);
    }

    pub fn point_written(&self) {
        self.counters.written.fetch_add(1, Ordering::Relaxed);
        self.sink.point_written();
    }

    pub fn ping_failed(&self, endpoint: &'static str, error: &Error) {
        self.sink.ping_failed(endpoint, error);
    }

    pub fn reconnect_succeeded(&self, endpoint: &'static str, attempt: u32) {
        self.sink.reconnect_succeeded(endpoint, attempt);
    }

    pub fn reconnect_failed(&self, endpoint: &'static str, attempt: u32, error: &Error, last: bool) {
        self.sink.reconnect_failed(endpoint, attempt, error, last);
    }

    /// Drains the counters into a summary every `period`. Never returns.
    pub async fn run_summary(self, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let window = self.counters.drain();
            self.sink.summary(&window);
        }
    }
}
