pub mod batch;
pub mod client;
pub mod line_protocol;
pub mod publisher;

pub use batch::{BatchWriter, Batcher, PointSink};
pub use client::InfluxClient;
pub use line_protocol::{FieldValue, Point};
pub use publisher::{InfluxEndpoint, InfluxHandle, Publisher};
