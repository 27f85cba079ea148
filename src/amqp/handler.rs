use async_trait::async_trait;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::parser::{ParseError, Parser, Payload};
use crate::stats::StatsLog;
use crate::Result;

/// Receives every successfully parsed payload.
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str {
        "subscriber"
    }

    fn notify(&self, payload: &Payload) -> Result<()>;
}

/// Where raw message bodies are republished, unmodified.
#[async_trait]
pub trait RawSink: Send + Sync {
    async fn republish(&self, queue: &str, body: &[u8]) -> Result<()>;
}

/// Optional side-channel queues.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    pub backup: Option<String>,
    pub error: Option<String>,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Parsed and handed to every subscriber; `failed` of them returned an
    /// error.
    Dispatched { failed: usize },
    /// Failed to parse. `routed` if it reached the error queue.
    Rejected { routed: bool },
}

/// The per-message pipeline: replicate, parse, route, dispatch.
pub struct DeliveryHandler {
    parser: Box<dyn Parser>,
    routes: Routes,
    subscribers: Vec<Arc<dyn Subscriber>>,
    stats: StatsLog,
}

impl DeliveryHandler {
    pub fn new(parser: Box<dyn Parser>, routes: Routes, stats: StatsLog) -> Self {
        Self {
            parser,
            routes,
            subscribers: Vec::new(),
            stats,
        }
    }

    /// Subscribers are notified in registration order.
    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub async fn handle(&self, sink: &dyn RawSink, body: &[u8]) -> Outcome {
        if let Some(queue) = &self.routes.backup {
            match sink.republish(queue, body).await {
                Ok(()) => self.stats.message_backed_up(),
                Err(e) => warn!(queue = %queue, error = %e, "Failed to copy message to backup queue"),
            }
        }

        let parsed = match std::str::from_utf8(body) {
            Ok(raw) => self.parser.parse(raw),
            Err(e) => Err(ParseError::new(
                format!("payload is not valid UTF-8: {}", e),
                &String::from_utf8_lossy(body),
            )),
        };

        match parsed {
            Ok(payload) => {
                self.stats.message_read();
                Outcome::Dispatched {
                    failed: self.dispatch(&payload),
                }
            }
            Err(error) => {
                let routed = match &self.routes.error {
                    Some(queue) => match sink.republish(queue, body).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(queue = %queue, error = %e, "Failed to move message to error queue");
                            false
                        }
                    },
                    None => false,
                };
                self.stats
                    .message_errored(&String::from_utf8_lossy(body), &error, routed);
                Outcome::Rejected { routed }
            }
        }
    }

    /// A failing subscriber is logged and skipped; the rest still run.
    fn dispatch(&self, payload: &Payload) -> usize {
        let mut failed = 0;
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.notify(payload) {
                failed += 1;
                warn!(
                    subscriber = subscriber.name(),
                    metric = payload.metric(),
                    error = %e,
                    "Subscriber rejected payload"
                );
            } else {
                trace!(subscriber = subscriber.name(), "Payload dispatched");
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{LineParser, TimestampUnit};
    use crate::Error;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        refuse: Option<&'static str>,
    }

    #[async_trait]
    impl RawSink for RecordingSink {
        async fn republish(&self, queue: &str, body: &[u8]) -> Result<()> {
            if self.refuse == Some(queue) {
                return Err(Error::Connection("channel closed".to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((queue.to_string(), body.to_vec()));
            Ok(())
        }
    }

    struct Named {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl Subscriber for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn notify(&self, _payload: &Payload) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                Err(Error::Subscriber(format!("{} is broken", self.name)))
            } else {
                Ok(())
            }
        }
    }

    fn handler(routes: Routes, stats: StatsLog) -> DeliveryHandler {
        DeliveryHandler::new(
            Box::new(LineParser::new(true, TimestampUnit::Nanos)),
            routes,
            stats,
        )
    }

    fn all_routes() -> Routes {
        Routes {
            backup: Some("backup".to_string()),
            error: Some("error".to_string()),
        }
    }

    #[tokio::test]
    async fn test_good_message_is_backed_up_and_dispatched() {
        let stats = StatsLog::silent();
        let mut handler = handler(all_routes(), stats.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        handler.subscribe(Arc::new(Named {
            name: "a",
            log: log.clone(),
            fail: false,
        }));
        let sink = RecordingSink::default();

        let outcome = handler
            .handle(&sink, b"cpu,host=a idle=90 1620000000")
            .await;

        assert_eq!(outcome, Outcome::Dispatched { failed: 0 });
        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "backup");
        assert_eq!(published[0].1, b"cpu,host=a idle=90 1620000000");
        assert_eq!(*log.lock().unwrap(), vec!["a"]);

        let window = stats.counters().drain();
        assert_eq!((window.read, window.backed_up, window.errored), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_bad_message_is_backed_up_and_routed() {
        let stats = StatsLog::silent();
        let handler = handler(all_routes(), stats.clone());
        let sink = RecordingSink::default();

        let outcome = handler.handle(&sink, b"cpu idle=90 not-a-time").await;

        assert_eq!(outcome, Outcome::Rejected { routed: true });
        let queues: Vec<String> = sink
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|(q, _)| q.clone())
            .collect();
        assert_eq!(queues, vec!["backup", "error"]);

        let window = stats.counters().drain();
        assert_eq!((window.read, window.backed_up, window.errored), (0, 1, 1));
    }

    #[tokio::test]
    async fn test_no_routes_configured() {
        let stats = StatsLog::silent();
        let handler = handler(Routes::default(), stats.clone());
        let sink = RecordingSink::default();

        assert_eq!(
            handler.handle(&sink, b"garbage").await,
            Outcome::Rejected { routed: false }
        );
        assert!(sink.published.lock().unwrap().is_empty());
        assert_eq!(stats.counters().drain().errored, 1);
    }

    #[tokio::test]
    async fn test_failed_error_routing_is_reported() {
        let stats = StatsLog::silent();
        let handler = handler(all_routes(), stats.clone());
        let sink = RecordingSink {
            refuse: Some("error"),
            ..Default::default()
        };

        assert_eq!(
            handler.handle(&sink, b"garbage").await,
            Outcome::Rejected { routed: false }
        );
        assert_eq!(stats.counters().drain().errored, 1);
    }

    #[tokio::test]
    async fn test_failed_backup_is_not_counted() {
        let stats = StatsLog::silent();
        let handler = handler(all_routes(), stats.clone());
        let sink = RecordingSink {
            refuse: Some("backup"),
            ..Default::default()
        };

        let outcome = handler.handle(&sink, b"cpu idle=1 1620000000").await;

        assert_eq!(outcome, Outcome::Dispatched { failed: 0 });
        let window = stats.counters().drain();
        assert_eq!((window.read, window.backed_up), (1, 0));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_a_parse_error() {
        let stats = StatsLog::silent();
        let handler = handler(all_routes(), stats.clone());
        let sink = RecordingSink::default();

        let outcome = handler.handle(&sink, &[0x63, 0xff, 0xfe]).await;

        assert_eq!(outcome, Outcome::Rejected { routed: true });
        let published = sink.published.lock().unwrap();
        assert_eq!(published[1].1, vec![0x63, 0xff, 0xfe]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let handler_stats = StatsLog::silent();
        let mut handler = handler(Routes::default(), handler_stats);
        let log = Arc::new(Mutex::new(Vec::new()));
        for (name, fail) in [("first", false), ("broken", true), ("last", false)] {
            handler.subscribe(Arc::new(Named {
                name,
                log: log.clone(),
                fail,
            }));
        }
        assert_eq!(handler.subscriber_count(), 3);

        let outcome = handler
            .handle(&RecordingSink::default(), b"cpu idle=1 1620000000")
            .await;

        assert_eq!(outcome, Outcome::Dispatched { failed: 1 });
        assert_eq!(*log.lock().unwrap(), vec!["first", "broken", "last"]);
    }
}
