use async_trait::async_trait;
use std::future::pending;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

use super::line_protocol::Point;
use crate::Result;

/// Destination of a flushed batch.
#[async_trait]
pub trait PointSink: Send + Sync + 'static {
    async fn write_points(&self, points: &[Point]) -> Result<()>;
}

/// Collects points until either `max_points` are buffered or the first one
/// has waited `max_age`.
#[derive(Debug)]
pub struct Batcher {
    max_points: usize,
    max_age: Duration,
    points: Vec<Point>,
    first_at: Option<Instant>,
}

impl Batcher {
    pub fn new(max_points: usize, max_age: Duration) -> Self {
        Self {
            max_points: max_points.max(1),
            max_age,
            points: Vec::new(),
            first_at: None,
        }
    }

    /// Buffers a point and returns the batch once it is full.
    pub fn push(&mut self, point: Point, now: Instant) -> Option<Vec<Point>> {
        if self.points.is_empty() {
            self.first_at = Some(now);
        }
        self.points.push(point);
        if self.points.len() >= self.max_points {
            self.take()
        } else {
            None
        }
    }

    /// When the current batch must be flushed, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_at.map(|at| at + self.max_age)
    }

    /// Returns the batch if its oldest point has waited long enough.
    pub fn take_expired(&mut self, now: Instant) -> Option<Vec<Point>> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take(),
            _ => None,
        }
    }

    pub fn take(&mut self) -> Option<Vec<Point>> {
        self.first_at = None;
        if self.points.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.points))
        }
    }

}

/// Owns one batch for one connection and flushes it to `sink`.
///
/// Fed through a bounded channel; while a flush is in flight, senders see
/// the channel fill up instead of growing memory. Runs until every sender
/// is dropped, then flushes what is left.
pub struct BatchWriter<S: PointSink> {
    sink: S,
    batcher: Batcher,
}

impl<S: PointSink> BatchWriter<S> {
    pub fn new(sink: S, batcher: Batcher) -> Self {
        Self { sink, batcher }
    }

    /// Starts the writer and returns the channel feeding it, holding at
    /// most `capacity` points not yet taken into the batch.
    pub fn spawn(self, capacity: usize) -> mpsc::Sender<Point> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(self.run(rx));
        tx
    }

    pub async fn run(mut self, mut points: mpsc::Receiver<Point>) {
        loop {
            let deadline = self.batcher.deadline();
            let expired = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                received = points.recv() => match received {
                    Some(point) => {
                        if let Some(batch) = self.batcher.push(point, Instant::now()) {
                            self.flush(batch).await;
                        }
                    }
                    None => {
                        if let Some(batch) = self.batcher.take() {
                            self.flush(batch).await;
                        }
                        debug!("Batch writer closed");
                        return;
                    }
                },
                _ = expired => {
                    if let Some(batch) = self.batcher.take_expired(Instant::now()) {
                        self.flush(batch).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, batch: Vec<Point>) {
        match self.sink.write_points(&batch).await {
            Ok(()) => debug!(points = batch.len(), "Flushed batch"),
            Err(e) => error!(points = batch.len(), error = %e, "Failed to write batch, points dropped"),
        }
    }
}
