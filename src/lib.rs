pub mod amqp;
pub mod bridge;
pub mod config;
pub mod error;
pub mod health;
pub mod influx;
pub mod parser;
pub mod stats;

pub use bridge::Bridge;
pub use config::Config;
pub use error::{Error, Result};
