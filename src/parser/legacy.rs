use std::collections::BTreeMap;

use super::{parse_timestamp, FieldText, ParseError, Parser, Payload, TimestampUnit};

/// Timestamps above this are taken to be finer than milliseconds.
const MILLIS_CEILING: i64 = 10_000_000_000_000;

/// Parses the older two-field format:
///
/// ```text
/// cpu.idle host=a timestamp=1620000000000 value=90
/// ```
///
/// `timestamp` and `value` must each appear exactly once; every other key is
/// a tag. Timestamps are always reported in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct LegacyParser;

impl LegacyParser {
    pub fn new() -> Self {
        Self
    }

    /// Divides once by 1000 when the value looks finer-grained than millis.
    pub fn normalize_timestamp(value: i64) -> i64 {
        if value > MILLIS_CEILING {
            value / 1000
        } else {
            value
        }
    }
}

impl Parser for LegacyParser {
    fn parse(&self, raw: &str) -> Result<Payload, ParseError> {
        let mut tokens = raw.split_whitespace();
        let metric = tokens
            .next()
            .ok_or_else(|| ParseError::new("metric is empty", raw))?;
        if metric.contains('=') {
            return Err(ParseError::new("missing metric", metric));
        }

        let mut timestamp = None;
        let mut value = None;
        let mut tags = BTreeMap::new();

        for token in tokens {
            let (key, val) = token
                .split_once('=')
                .ok_or_else(|| ParseError::new("expected key=value", token))?;
            if key.is_empty() || val.is_empty() {
                return Err(ParseError::new("empty key or value", token));
            }
            let slot = match key {
                "timestamp" => &mut timestamp,
                "value" => &mut value,
                _ => {
                    tags.insert(key.to_string(), val.to_string());
                    continue;
                }
            };
            if slot.replace(val).is_some() {
                return Err(ParseError::new(format!("duplicate '{}'", key), token));
            }
        }

        let timestamp = timestamp.ok_or_else(|| ParseError::new("missing timestamp", raw))?;
        let value = value.ok_or_else(|| ParseError::new("missing value", raw))?;

        let timestamp = Self::normalize_timestamp(parse_timestamp(timestamp)?);
        let fields = BTreeMap::from([("value".to_string(), FieldText::Bare(value.to_string()))]);

        Payload::new(metric, tags, fields, timestamp, TimestampUnit::Millis)
    }
}
