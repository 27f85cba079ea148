use futures::future::select_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::amqp::{BrokerEndpoint, Consumer, DeliveryHandler, Routes};
use crate::health::{establish, EndpointCell, HealthMonitor, HealthPolicy};
use crate::influx::{InfluxEndpoint, Publisher};
use crate::parser;
use crate::stats::StatsLog;
use crate::{Config, Error, Result};

/// Wires the consumer, the publisher, both health monitors and the stats
/// reporter together.
pub struct Bridge {
    config: Config,
    stats: StatsLog,
}

impl Bridge {
    pub fn new(config: Config, stats: StatsLog) -> Self {
        Self { config, stats }
    }

    /// Connects both endpoints and runs until one of them is lost for good
    /// or the process is interrupted.
    ///
    /// Failing to connect at startup is an error; nothing is retried.
    pub async fn run(self) -> Result<()> {
        let Self { config, stats } = self;
        config.validate()?;

        let parser = parser::from_config(&config.parser);
        let broker = BrokerEndpoint::new(config.amqp_uri(), config.broker.clone());
        let influx = InfluxEndpoint::new(config.influx.clone());
        let broker_timeout = config.broker.connect_timeout();
        let influx_timeout = config.influx.request_timeout();

        let broker_cell = Arc::new(EndpointCell::new(establish(&broker, broker_timeout).await?));
        let influx_cell = Arc::new(EndpointCell::new(establish(&influx, influx_timeout).await?));

        let routes = Routes {
            backup: config.broker.backup_queue.clone(),
            error: config.broker.error_queue.clone(),
        };
        let mut consumer = Consumer::new(
            broker_cell.clone(),
            DeliveryHandler::new(parser, routes, stats.clone()),
            config.broker.queue.clone(),
            config.broker.consumer_tag.clone(),
            config.health.reconnect_delay(),
        );
        consumer.subscribe(Arc::new(Publisher::new(influx_cell.clone(), stats.clone())));

        let broker_monitor = HealthMonitor::new(
            broker,
            broker_cell,
            HealthPolicy::broker(&config.health, broker_timeout),
            stats.clone(),
        );
        let influx_monitor = HealthMonitor::new(
            influx,
            influx_cell,
            HealthPolicy::influx(&config.health, influx_timeout),
            stats.clone(),
        );

        let mut tasks = vec![
            ("rabbitmq monitor", tokio::spawn(broker_monitor.run())),
            ("influxdb monitor", tokio::spawn(influx_monitor.run())),
        ];
        if config.stats.enabled {
            let interval = Duration::from_millis(config.stats.interval_ms);
            tasks.push((
                "stats summary",
                tokio::spawn(async move {
                    stats.run_summary(interval).await;
                    Ok(())
                }),
            ));
        }

        info!(
            format = ?config.parser.format,
            infer_timestamp_unit = config.parser.infer_timestamp_unit,
            "Bridge running"
        );

        supervise(consumer.run(), tasks).await
    }
}

type Task = (&'static str, JoinHandle<Result<()>>);

/// Drives the consumer on the current task while the background tasks run
/// on their own. The first of them to finish, or Ctrl-C, ends the bridge and
/// the rest are aborted.
async fn supervise<F>(consumer: F, tasks: Vec<Task>) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

    let background = async {
        if handles.is_empty() {
            return std::future::pending().await;
        }
        let (joined, index, _) = select_all(handles).await;
        let task = names[index];
        match joined {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!(task, error = %e, "Background task failed");
                }
                result
            }
            Err(e) => Err(Error::Task {
                task,
                message: e.to_string(),
            }),
        }
    };

    let result = tokio::select! {
        result = consumer => result,
        result = background => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    for abort in aborts {
        abort.abort();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, InfluxConfig};
    use std::future::pending;

    fn unreachable_config() -> Config {
        Config {
            broker: BrokerConfig {
                host: "127.0.0.1".to_string(),
                port: 9,
                username: "guest".to_string(),
                password: "guest".to_string(),
                virtual_host: "/".to_string(),
                queue: "metrics".to_string(),
                backup_queue: None,
                error_queue: None,
                consumer_tag: "test".to_string(),
                connect_timeout_secs: 2,
            },
            influx: InfluxConfig {
                url: "http://127.0.0.1:9".to_string(),
                database: "telemetry".to_string(),
                username: None,
                password: None,
                retention_policy: "autogen".to_string(),
                points_to_flush: 10,
                millis_to_flush: 100,
                max_pending_points: 100,
                request_timeout_secs: 1,
            },
            health: Default::default(),
            parser: Default::default(),
            stats: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_connecting() {
        let mut config = unreachable_config();
        config.broker.queue = String::new();

        let result = Bridge::new(config, StatsLog::silent()).run().await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_fatal_at_startup() {
        let result = Bridge::new(unreachable_config(), StatsLog::silent())
            .run()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failing_task_ends_the_bridge() {
        let tasks: Vec<Task> = vec![
            ("idle", tokio::spawn(pending::<Result<()>>())),
            (
                "rabbitmq monitor",
                tokio::spawn(async {
                    Err(Error::ReconnectExhausted {
                        endpoint: "rabbitmq",
                        attempts: 3,
                    })
                }),
            ),
        ];

        let result = supervise(pending(), tasks).await;
        assert!(matches!(
            result,
            Err(Error::ReconnectExhausted {
                endpoint: "rabbitmq",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let tasks: Vec<Task> = vec![(
            "stats summary",
            tokio::spawn(async {
                if true {
                    panic!("summary blew up");
                }
                Ok(())
            }),
        )];

        let result = supervise(pending(), tasks).await;
        assert!(matches!(
            result,
            Err(Error::Task {
                task: "stats summary",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_consumer_exit_aborts_background_tasks() {
        let held = Arc::new(());
        let guard = held.clone();
        let tasks: Vec<Task> = vec![(
            "influxdb monitor",
            tokio::spawn(async move {
                let _guard = guard;
                pending::<Result<()>>().await
            }),
        )];

        let consumer = async { Err(Error::Connection("monitor gone".to_string())) };
        let result = supervise(consumer, tasks).await;
        assert!(matches!(result, Err(Error::Connection(_))));

        for _ in 0..10 {
            if Arc::strong_count(&held) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(&held), 1);
    }
}
