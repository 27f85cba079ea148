use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::{parse_timestamp, FieldText, ParseError, Parser, Payload, TimestampUnit};

/// Parses JSON documents with a fixed schema:
///
/// ```json
/// {"metric": "cpu", "tags": {"host": "a"}, "value": 90, "timestamp": 1620000000000}
/// ```
///
/// The single value is stored as field `value`; a JSON string stays a
/// string. Unknown keys are rejected.
#[derive(Debug, Clone)]
pub struct FixedSchemaParser {
    unit: TimestampUnit,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Record {
    metric: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    value: Value,
    timestamp: Value,
}

impl FixedSchemaParser {
    pub fn new(unit: TimestampUnit) -> Self {
        Self { unit }
    }
}

impl Parser for FixedSchemaParser {
    fn parse(&self, raw: &str) -> Result<Payload, ParseError> {
        let record: Record =
            serde_json::from_str(raw).map_err(|e| ParseError::new(e.to_string(), raw))?;

        let timestamp = match &record.timestamp {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| ParseError::new("timestamp is not an integer", &n.to_string()))?,
            Value::String(s) => parse_timestamp(s)?,
            other => {
                return Err(ParseError::new(
                    "timestamp is not an integer",
                    &other.to_string(),
                ))
            }
        };

        let value = match record.value {
            Value::Number(n) => FieldText::Bare(n.to_string()),
            Value::String(s) => FieldText::Quoted(s),
            Value::Bool(b) => FieldText::Bare(b.to_string()),
            other => return Err(ParseError::new("value must be a scalar", &other.to_string())),
        };

        let fields = BTreeMap::from([("value".to_string(), value)]);
        Payload::new(record.metric, record.tags, fields, timestamp, self.unit)
    }
}
