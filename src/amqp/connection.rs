use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, instrument, warn};

use super::consumer::{Deliveries, DeliverySource};
use super::handler::RawSink;
use crate::config::BrokerConfig;
use crate::health::Endpoint;
use crate::{Error, Result};

/// An open broker connection with the channel all traffic goes through.
pub struct BrokerHandle {
    connection: Connection,
    channel: Channel,
}

impl BrokerHandle {
    /// Fails if `queue` is missing or the channel is gone.
    pub async fn check_queue(&self, queue: &str) -> Result<u32> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Connection(format!("queue '{}' is not available: {}", queue, e)))?;
        Ok(declared.message_count())
    }
}

#[async_trait]
impl DeliverySource for BrokerHandle {
    /// Starts a no-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(|d| d.data).map_err(Error::from))
            .boxed())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close(200, "replaced").await {
            debug!(error = %e, "Closing stale broker connection failed");
        }
    }
}

#[async_trait]
impl RawSink for BrokerHandle {
    /// Publishes through the default exchange, so the routing key is the
    /// queue name. Confirms are not awaited.
    async fn republish(&self, queue: &str, body: &[u8]) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?;
        Ok(())
    }
}

pub struct BrokerEndpoint {
    uri: String,
    config: BrokerConfig,
}

impl BrokerEndpoint {
    pub fn new(uri: String, config: BrokerConfig) -> Self {
        Self { uri, config }
    }

    fn queues(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.config.queue.as_str())
            .chain(self.config.backup_queue.as_deref())
            .chain(self.config.error_queue.as_deref())
    }
}

#[async_trait]
impl Endpoint for BrokerEndpoint {
    type Handle = BrokerHandle;

    fn name(&self) -> &'static str {
        "rabbitmq"
    }

    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    async fn connect(&self) -> Result<BrokerHandle> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        let handle = BrokerHandle {
            connection,
            channel,
        };

        for queue in self.queues() {
            let pending = handle.check_queue(queue).await?;
            debug!(queue, pending, "Queue available");
        }

        info!(
            host = %self.config.host,
            port = self.config.port,
            virtual_host = %self.config.virtual_host,
            username = %self.config.username,
            queue = %self.config.queue,
            backup_queue = ?self.config.backup_queue,
            error_queue = ?self.config.error_queue,
            "Connected to RabbitMQ"
        );
        Ok(handle)
    }

    async fn ping(&self, handle: &BrokerHandle) -> Result<()> {
        if !handle.is_connected() {
            warn!(host = %self.config.host, "Broker connection is closed");
            return Err(Error::Ping {
                endpoint: "rabbitmq",
                message: "connection is closed".to_string(),
            });
        }
        handle
            .check_queue(&self.config.queue)
            .await
            .map(|_| ())
            .map_err(|e| Error::Ping {
                endpoint: "rabbitmq",
                message: e.to_string(),
            })
    }
}
