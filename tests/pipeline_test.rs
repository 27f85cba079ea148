mod common;

use amqp_influx::amqp::{DeliveryHandler, Outcome, Routes, Subscriber};
use amqp_influx::config::ParserConfig;
use amqp_influx::health::EndpointCell;
use amqp_influx::influx::line_protocol::encode_batch;
use amqp_influx::influx::{InfluxClient, InfluxHandle, Point, Publisher};
use amqp_influx::parser::{self, ParseError, ParserKind, Payload, TimestampUnit};
use amqp_influx::stats::{DiagnosticsSink, StatsLog};
use amqp_influx::{Error, Result};
use common::{get_test_config, RecordingSink};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct ErrorLog {
    errors: Mutex<Vec<(String, bool)>>,
}

impl DiagnosticsSink for ErrorLog {
    fn message_errored(&self, _raw: &str, error: &ParseError, routed: bool) {
        self.errors
            .lock()
            .unwrap()
            .push((error.reason.clone(), routed));
    }
}

struct Pipeline {
    handler: DeliveryHandler,
    points: mpsc::Receiver<Point>,
    stats: StatsLog,
    errors: Arc<ErrorLog>,
}

fn pipeline(parser_config: &ParserConfig) -> Pipeline {
    let config = get_test_config();
    let errors = Arc::new(ErrorLog::default());
    let stats = StatsLog::new(errors.clone());

    let client = InfluxClient::new(&config.influx).unwrap();
    let (tx, points) = mpsc::channel(64);
    let cell = Arc::new(EndpointCell::new(InfluxHandle::new(client, tx)));

    let mut handler = DeliveryHandler::new(
        parser::from_config(parser_config),
        Routes {
            backup: config.broker.backup_queue.clone(),
            error: config.broker.error_queue.clone(),
        },
        stats.clone(),
    );
    handler.subscribe(Arc::new(Publisher::new(cell, stats.clone())));

    Pipeline {
        handler,
        points,
        stats,
        errors,
    }
}

fn line_config(infer: bool) -> ParserConfig {
    ParserConfig {
        format: ParserKind::Line,
        infer_timestamp_unit: infer,
        default_unit: TimestampUnit::Nanos,
    }
}

#[tokio::test]
async fn test_line_message_becomes_point() {
    let mut p = pipeline(&line_config(true));
    let sink = RecordingSink::default();

    let outcome = p
        .handler
        .handle(&sink, b"cpu,host=a idle=90,user=9 1620000000")
        .await;
    assert_eq!(outcome, Outcome::Dispatched { failed: 0 });

    let point = p.points.recv().await.unwrap();
    assert_eq!(
        encode_batch(&[point]),
        "cpu,host=a idle=90,user=9 1620000000000000000"
    );

    let window = p.stats.counters().drain();
    assert_eq!(
        (window.read, window.backed_up, window.errored, window.written),
        (1, 1, 0, 1)
    );
}

#[tokio::test]
async fn test_backup_receives_every_message_unchanged() {
    let mut p = pipeline(&line_config(false));
    let sink = RecordingSink::default();
    let config = get_test_config();
    let backup = config.broker.backup_queue.unwrap();

    let messages: [&[u8]; 5] = [
        b"cpu idle=1 1",
        b"not a metric",
        b"mem,host=b used=42 2",
        &[0xc3, 0x28],
        b"disk free=\"lots\" 3",
    ];
    for body in &messages {
        p.handler.handle(&sink, body).await;
    }

    let copied = sink.bodies(&backup);
    assert_eq!(copied.len(), messages.len());
    for (copy, original) in copied.iter().zip(&messages) {
        assert_eq!(copy.as_slice(), *original);
    }
    assert_eq!(p.stats.counters().drain().backed_up, messages.len() as u64);

    let mut timestamps = Vec::new();
    while let Ok(point) = p.points.try_recv() {
        timestamps.push(point.timestamp_ns);
    }
    assert_eq!(timestamps, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_error_queue_receives_exactly_the_failures() {
    let p = pipeline(&line_config(false));
    let sink = RecordingSink::default();
    let error_queue = get_test_config().broker.error_queue.unwrap();

    let messages: [&[u8]; 5] = [
        b"cpu idle=1 1",
        b"cpu idle=1",
        b"cpu idle=1 yesterday",
        b"cpu idle=2 2",
        b"",
    ];
    let mut failures = 0;
    for body in messages {
        if let Outcome::Rejected { routed } = p.handler.handle(&sink, body).await {
            assert!(routed);
            failures += 1;
        }
    }

    assert_eq!(failures, 3);
    assert_eq!(sink.bodies(&error_queue).len(), 3);
    assert_eq!(sink.bodies(&error_queue)[1], b"cpu idle=1 yesterday");

    let window = p.stats.counters().drain();
    assert_eq!((window.read, window.errored), (2, 3));
    assert_eq!(p.errors.errors.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_legacy_missing_metric_is_one_error() {
    let config = ParserConfig {
        format: ParserKind::Legacy,
        ..Default::default()
    };
    let mut p = pipeline(&config);
    let sink = RecordingSink::default();

    let outcome = p.handler.handle(&sink, b"timestamp=1620000000000 value=3").await;

    assert_eq!(outcome, Outcome::Rejected { routed: true });
    assert_eq!(p.stats.counters().drain().errored, 1);
    assert!(p.points.try_recv().is_err());

    let errors = p.errors.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].1, "diagnostic should report the routing result");
}

#[tokio::test]
async fn test_legacy_message_becomes_point() {
    let config = ParserConfig {
        format: ParserKind::Legacy,
        ..Default::default()
    };
    let mut p = pipeline(&config);

    p.handler
        .handle(
            &RecordingSink::default(),
            b"temperature room=kitchen timestamp=1620000000000 value=21.5",
        )
        .await;

    let point = p.points.recv().await.unwrap();
    assert_eq!(
        point.to_line_protocol(),
        "temperature,room=kitchen value=21.5 1620000000000000000"
    );
}

#[tokio::test]
async fn test_fixed_schema_message_becomes_point() {
    let config = ParserConfig {
        format: ParserKind::Fixed,
        default_unit: TimestampUnit::Millis,
        ..Default::default()
    };
    let mut p = pipeline(&config);

    let body = br#"{"metric":"load","tags":{"host":"a"},"value":3,"timestamp":1620000000000}"#;
    p.handler.handle(&RecordingSink::default(), body).await;

    let point = p.points.recv().await.unwrap();
    assert_eq!(point.to_line_protocol(), "load,host=a value=3 1620000000000000000");
}

struct Failing;

impl Subscriber for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn notify(&self, _payload: &Payload) -> Result<()> {
        Err(Error::Subscriber("always fails".to_string()))
    }
}

#[tokio::test]
async fn test_failing_subscriber_does_not_block_publisher() {
    let config = get_test_config();
    let stats = StatsLog::silent();
    let client = InfluxClient::new(&config.influx).unwrap();
    let (tx, mut points) = mpsc::channel(64);
    let cell = Arc::new(EndpointCell::new(InfluxHandle::new(client, tx)));

    let mut handler = DeliveryHandler::new(
        parser::from_config(&line_config(false)),
        Routes::default(),
        stats.clone(),
    );
    handler.subscribe(Arc::new(Failing));
    handler.subscribe(Arc::new(Publisher::new(cell, stats.clone())));

    let outcome = handler
        .handle(&RecordingSink::default(), b"cpu idle=1 7")
        .await;

    assert_eq!(outcome, Outcome::Dispatched { failed: 1 });
    assert_eq!(points.recv().await.unwrap().timestamp_ns, 7);
    assert_eq!(stats.counters().drain().written, 1);
}

#[tokio::test]
async fn test_unavailable_backup_queue_is_not_counted() {
    let p = pipeline(&line_config(false));
    let sink = RecordingSink {
        refuse: get_test_config().broker.backup_queue,
        ..Default::default()
    };

    let outcome = p.handler.handle(&sink, b"cpu idle=1 1").await;

    assert_eq!(outcome, Outcome::Dispatched { failed: 0 });
    let window = p.stats.counters().drain();
    assert_eq!((window.read, window.backed_up), (1, 0));
}
