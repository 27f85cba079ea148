pub mod connection;
pub mod consumer;
pub mod handler;

pub use connection::{BrokerEndpoint, BrokerHandle};
pub use consumer::{Consumer, Deliveries, DeliverySource};
pub use handler::{DeliveryHandler, Outcome, RawSink, Routes, Subscriber};
