use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ParseError;

/// Resolution of a payload timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampUnit {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl TimestampUnit {
    /// Picks a unit from the magnitude of an epoch timestamp.
    ///
    /// Brackets are decades apart so any date between 1973 and 5138 lands in
    /// the right one: below `10^11` seconds, below `10^14` millis, below
    /// `10^17` micros, otherwise nanos.
    pub fn infer(value: i64) -> Self {
        let magnitude = value.unsigned_abs();
        if magnitude < 100_000_000_000 {
            TimestampUnit::Seconds
        } else if magnitude < 100_000_000_000_000 {
            TimestampUnit::Millis
        } else if magnitude < 100_000_000_000_000_000 {
            TimestampUnit::Micros
        } else {
            TimestampUnit::Nanos
        }
    }

    pub fn nanos_per_unit(self) -> i64 {
        match self {
            TimestampUnit::Seconds => 1_000_000_000,
            TimestampUnit::Millis => 1_000_000,
            TimestampUnit::Micros => 1_000,
            TimestampUnit::Nanos => 1,
        }
    }

    /// Converts `value` in this unit to nanoseconds, `None` on overflow.
    pub fn to_nanos(self, value: i64) -> Option<i64> {
        value.checked_mul(self.nanos_per_unit())
    }
}

/// A field value as it appeared in the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldText {
    /// Unquoted text, typed when the point is built.
    Bare(String),
    /// Quoted in the source; always stays a string.
    Quoted(String),
}

impl FieldText {
    pub fn as_str(&self) -> &str {
        match self {
            FieldText::Bare(s) | FieldText::Quoted(s) => s,
        }
    }

    pub fn is_quoted(&self) -> bool {
        matches!(self, FieldText::Quoted(_))
    }
}

/// One successfully parsed message.
///
/// Built only by parsers; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    metric: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldText>,
    timestamp_value: i64,
    timestamp_unit: TimestampUnit,
}

impl Payload {
    pub fn new(
        metric: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldText>,
        timestamp_value: i64,
        timestamp_unit: TimestampUnit,
    ) -> Result<Self, ParseError> {
        let metric = metric.into();
        if metric.is_empty() {
            return Err(ParseError::new("metric is empty", ""));
        }
        if fields.is_empty() {
            return Err(ParseError::new("no fields", &metric));
        }

        // A line break would split the encoded point in two.
        let texts = std::iter::once(metric.as_str())
            .chain(tags.iter().flat_map(|(k, v)| [k.as_str(), v.as_str()]))
            .chain(fields.iter().flat_map(|(k, v)| [k.as_str(), v.as_str()]));
        for text in texts {
            if text.contains(|c: char| c == '\n' || c == '\r') {
                return Err(ParseError::new("line break in name or value", text));
            }
        }
        Ok(Self {
            metric,
            tags,
            fields,
            timestamp_value,
            timestamp_unit,
        })
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldText> {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(FieldText::as_str)
    }

    pub fn timestamp_value(&self) -> i64 {
        self.timestamp_value
    }

    pub fn timestamp_unit(&self) -> TimestampUnit {
        self.timestamp_unit
    }
}
