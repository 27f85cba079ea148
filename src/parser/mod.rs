//! Wire-format parsing of raw queue messages into [`Payload`]s.
//!
//! Three interchangeable formats are supported, selected once from
//! configuration:
//!
//! - [`FixedSchemaParser`]: a JSON object with `metric`, `tags`, `value`
//!   and `timestamp`
//! - [`LineParser`]: `metric,tag=v field=v,field=v timestamp`, with optional
//!   timestamp unit inference
//! - [`LegacyParser`]: `metric key=value ...` with exactly one `timestamp`
//!   and one `value`
//!
//! # Example
//!
//! ```rust
//! use amqp_influx::parser::{LineParser, Parser, TimestampUnit};
//!
//! let parser = LineParser::new(true, TimestampUnit::Nanos);
//! let payload = parser.parse("cpu,host=a idle=90,user=9 1620000000").unwrap();
//!
//! assert_eq!(payload.metric(), "cpu");
//! assert_eq!(payload.tag("host"), Some("a"));
//! assert_eq!(payload.timestamp_unit(), TimestampUnit::Seconds);
//! ```

pub mod fixed;
pub mod legacy;
pub mod line;
pub mod payload;


use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ParserConfig;

pub use fixed::FixedSchemaParser;
pub use legacy::LegacyParser;
pub use line::LineParser;
pub use payload::{FieldText, Payload, TimestampUnit};

/// Longest fragment kept in a [`ParseError`].
const MAX_FRAGMENT_LEN: usize = 120;

/// A message that could not be turned into a payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Parse error: {reason} (at '{fragment}')")]
pub struct ParseError {
    /// What was wrong
    pub reason: String,
    /// The part of the input that caused it
    pub fragment: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>, fragment: &str) -> Self {
        let fragment = match fragment.char_indices().nth(MAX_FRAGMENT_LEN) {
            Some((end, _)) => format!("{}...", &fragment[..end]),
            None => fragment.to_string(),
        };
        Self {
            reason: reason.into(),
            fragment,
        }
    }
}

/// Turns one raw message into a payload, or fails without partial output.
pub trait Parser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<Payload, ParseError>;
}

/// Which wire format the bridge expects on its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    Fixed,
    #[default]
    Line,
    Legacy,
}

/// Builds the configured parser variant.
pub fn from_config(config: &ParserConfig) -> Box<dyn Parser> {
    match config.format {
        ParserKind::Fixed => Box::new(FixedSchemaParser::new(config.default_unit)),
        ParserKind::Line => Box::new(LineParser::new(
            config.infer_timestamp_unit,
            config.default_unit,
        )),
        ParserKind::Legacy => Box::new(LegacyParser::new()),
    }
}

/// Parses a timestamp token as a signed integer.
pub(crate) fn parse_timestamp(token: &str) -> Result<i64, ParseError> {
    token
        .trim()
        .parse::<i64>()
        .map_err(|_| ParseError::new("timestamp is not an integer", token))
}
