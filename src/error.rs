//! Error types and result handling for amqp-influx.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate. Per-message parse
//! failures have their own type, [`ParseError`](crate::parser::ParseError),
//! because they never escape the delivery handler.
//!
//! # Example
//!
//! ```rust
//! use amqp_influx::{Error, Result};
//!
//! fn connect_to_broker() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_broker() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for amqp-influx operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from an invalid file, environment or value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// RabbitMQ client or protocol error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// HTTP error talking to InfluxDB.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A liveness ping against an endpoint failed.
    #[error("Ping to {endpoint} failed: {message}")]
    Ping {
        /// Endpoint name ("rabbitmq" or "influxdb")
        endpoint: &'static str,
        /// Description of the failure
        message: String,
    },

    /// Every reconnect attempt for an endpoint failed. Fatal for the bridge.
    #[error("Could not reconnect to {endpoint} after {attempts} attempts")]
    ReconnectExhausted {
        /// Endpoint name
        endpoint: &'static str,
        /// Number of attempts made
        attempts: u32,
    },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// A payload could not be converted into a database point.
    #[error("Invalid point: {message}")]
    InvalidPoint {
        /// Description of what was invalid
        message: String,
    },

    /// A subscriber rejected a dispatched payload.
    #[error("Subscriber error: {0}")]
    Subscriber(String),

    /// The batch writer has too many points waiting; the point was not
    /// accepted.
    #[error("Batch buffer full: {pending} points waiting to be written")]
    Backpressure {
        /// Points already waiting
        pending: usize,
    },

    /// A background task panicked or was cancelled.
    #[error("Task {task} failed: {message}")]
    Task {
        /// Task name
        task: &'static str,
        /// Panic or cancellation description
        message: String,
    },
}

/// A convenient Result type alias for amqp-influx operations.
///
/// This is equivalent to `std::result::Result<T, amqp_influx::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
