use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::handler::{DeliveryHandler, RawSink, Subscriber};
use crate::health::EndpointCell;
use crate::{Error, Result};

/// Bound on closing a replaced connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Message bodies as they arrive from the broker.
pub type Deliveries = BoxStream<'static, Result<Vec<u8>>>;

/// A broker connection the consumer can read from.
#[async_trait]
pub trait DeliverySource: RawSink + 'static {
    /// Starts consuming `queue`; the stream ends when the broker cancels.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// Consumes the source queue on whatever broker connection is current.
///
/// When the delivery stream ends on a live connection, the consumer
/// subscribes again after `retry_delay`. On a dead one it waits for the
/// health monitor to install a replacement.
pub struct Consumer<H: DeliverySource> {
    cell: Arc<EndpointCell<H>>,
    handler: DeliveryHandler,
    queue: String,
    consumer_tag: String,
    retry_delay: Duration,
}

impl<H: DeliverySource> Consumer<H> {
    pub fn new(
        cell: Arc<EndpointCell<H>>,
        handler: DeliveryHandler,
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            cell,
            handler,
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            retry_delay,
        }
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.handler.subscribe(subscriber);
    }

    /// Returns only if the broker monitor is gone.
    pub async fn run(self) -> Result<()> {
        let mut generation = self.cell.subscribe();

        loop {
            generation.borrow_and_update();
            let handle = self.cell.load();

            match handle.consume(&self.queue, &self.consumer_tag).await {
                Ok(mut deliveries) => {
                    info!(
                        queue = %self.queue,
                        consumer_tag = %self.consumer_tag,
                        subscribers = self.handler.subscriber_count(),
                        "Consuming"
                    );
                    loop {
                        tokio::select! {
                            next = deliveries.next() => match next {
                                Some(Ok(body)) => {
                                    self.handler.handle(&*handle, &body).await;
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "Delivery stream failed");
                                    break;
                                }
                                None => {
                                    warn!(queue = %self.queue, "Delivery stream ended");
                                    break;
                                }
                            },
                            changed = generation.changed() => {
                                changed.map_err(|_| monitor_gone())?;
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(queue = %self.queue, error = %e, "Could not start consuming"),
            }

            if Arc::ptr_eq(&handle, &self.cell.load()) {
                if handle.is_connected() {
                    info!(delay = ?self.retry_delay, "Connection still up, resubscribing");
                    tokio::select! {
                        _ = sleep(self.retry_delay) => {}
                        changed = generation.changed() => changed.map_err(|_| monitor_gone())?,
                    }
                } else {
                    info!("Waiting for a new broker connection");
                    generation.changed().await.map_err(|_| monitor_gone())?;
                }
            }

            if !Arc::ptr_eq(&handle, &self.cell.load()) {
                info!("Broker connection replaced, resubscribing");
                if timeout(CLOSE_TIMEOUT, handle.close()).await.is_err() {
                    debug!("Stale broker connection did not close in time");
                }
            }
        }
    }
}

fn monitor_gone() -> Error {
    Error::Connection("broker connection cell was dropped".to_string())
}
