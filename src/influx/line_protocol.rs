//! InfluxDB line protocol encoding.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ns
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::parser::{FieldText, Payload};
use crate::{Error, Result};

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    /// Types a textual field the way a human would read it: `true`/`false`
    /// are booleans, `42i` is an integer, anything numeric is a float and
    /// everything else stays a string.
    pub fn infer(raw: &str) -> Self {
        match raw {
            "true" | "TRUE" | "True" | "t" | "T" => return FieldValue::Boolean(true),
            "false" | "FALSE" | "False" | "f" | "F" => return FieldValue::Boolean(false),
            _ => {}
        }
        if let Some(int) = raw.strip_suffix('i').and_then(|s| s.parse::<i64>().ok()) {
            return FieldValue::Integer(int);
        }
        match raw.parse::<f64>() {
            Ok(float) if float.is_finite() => FieldValue::Float(float),
            _ => FieldValue::String(raw.to_string()),
        }
    }

    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
            FieldValue::Boolean(v) => v.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

/// One database point, timestamped in nanoseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp_ns: i64,
}

impl Point {
    /// Maps a payload 1:1 onto a point.
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let timestamp_ns = payload
            .timestamp_unit()
            .to_nanos(payload.timestamp_value())
            .ok_or_else(|| Error::InvalidPoint {
                message: format!(
                    "timestamp {} {:?} is out of range",
                    payload.timestamp_value(),
                    payload.timestamp_unit()
                ),
            })?;

        Ok(Self {
            measurement: payload.metric().to_string(),
            tags: payload.tags().clone(),
            fields: payload
                .fields()
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        FieldText::Quoted(text) => FieldValue::String(text.clone()),
                        FieldText::Bare(text) => FieldValue::infer(text),
                    };
                    (k.clone(), value)
                })
                .collect(),
            timestamp_ns,
        })
    }

    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);

        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line.push(' ');
        line.push_str(&self.timestamp_ns.to_string());
        line
    }
}

/// Newline-separated body for one write request.
pub fn encode_batch(points: &[Point]) -> String {
    points
        .iter()
        .map(Point::to_line_protocol)
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

// Tag keys, tag values and field keys share the same rules.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
