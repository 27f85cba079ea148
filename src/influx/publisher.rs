use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::info;

use super::batch::{BatchWriter, Batcher};
use super::client::InfluxClient;
use super::line_protocol::Point;
use crate::amqp::Subscriber;
use crate::config::InfluxConfig;
use crate::health::{Endpoint, EndpointCell};
use crate::parser::Payload;
use crate::stats::StatsLog;
use crate::{Error, Result};

/// One live database connection: its client plus the batch fed by it.
pub struct InfluxHandle {
    client: InfluxClient,
    points: mpsc::Sender<Point>,
}

impl InfluxHandle {
    pub fn new(client: InfluxClient, points: mpsc::Sender<Point>) -> Self {
        Self { client, points }
    }

    pub fn client(&self) -> &InfluxClient {
        &self.client
    }

    /// Queues a point for the next flush. Never waits: a full queue rejects
    /// the point.
    pub fn submit(&self, point: Point) -> Result<()> {
        self.points.try_send(point).map_err(|e| match e {
            TrySendError::Full(_) => Error::Backpressure {
                pending: self.points.max_capacity(),
            },
            TrySendError::Closed(_) => {
                Error::Connection("batch writer for InfluxDB has stopped".to_string())
            }
        })
    }
}

/// Builds database connections. Every connection gets a fresh batch writer
/// configured with the flush thresholds.
pub struct InfluxEndpoint {
    config: InfluxConfig,
}

impl InfluxEndpoint {
    pub fn new(config: InfluxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Endpoint for InfluxEndpoint {
    type Handle = InfluxHandle;

    fn name(&self) -> &'static str {
        "influxdb"
    }

    async fn connect(&self) -> Result<InfluxHandle> {
        let client = InfluxClient::new(&self.config)?;
        let batcher = Batcher::new(self.config.points_to_flush, self.config.flush_after());
        let points =
            BatchWriter::new(client.clone(), batcher).spawn(self.config.max_pending_points);

        info!(
            url = %self.config.url,
            database = %self.config.database,
            points_to_flush = self.config.points_to_flush,
            millis_to_flush = self.config.millis_to_flush,
            max_pending_points = self.config.max_pending_points,
            "InfluxDB connection ready"
        );
        Ok(InfluxHandle::new(client, points))
    }

    async fn ping(&self, handle: &InfluxHandle) -> Result<()> {
        handle.client().ping().await
    }
}

/// Turns dispatched payloads into points on the current connection.
pub struct Publisher {
    cell: Arc<EndpointCell<InfluxHandle>>,
    stats: StatsLog,
}

impl Publisher {
    pub fn new(cell: Arc<EndpointCell<InfluxHandle>>, stats: StatsLog) -> Self {
        Self { cell, stats }
    }
}

impl Subscriber for Publisher {
    fn name(&self) -> &str {
        "influxdb-publisher"
    }

    /// Returns once the point is buffered; write failures surface only in
    /// the batch writer's log.
    fn notify(&self, payload: &Payload) -> Result<()> {
        let point = Point::from_payload(payload)?;
        self.cell.load().submit(point)?;
        self.stats.point_written();
        Ok(())
    }
}
