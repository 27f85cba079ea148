use std::collections::BTreeMap;

use super::{parse_timestamp, FieldText, ParseError, Parser, Payload, TimestampUnit};

/// Parses line-protocol style records carrying several fields at once:
///
/// ```text
/// cpu,host=a,region=eu idle=90,user=9 1620000000
/// ```
///
/// Spaces, commas and equals signs inside names are escaped with a
/// backslash. Field values may be double-quoted to carry spaces or commas;
/// quoted values are always strings.
#[derive(Debug, Clone)]
pub struct LineParser {
    infer_unit: bool,
    default_unit: TimestampUnit,
}

impl LineParser {
    /// With `infer_unit` the timestamp unit is chosen from the magnitude of
    /// each timestamp, otherwise `default_unit` is always used.
    pub fn new(infer_unit: bool, default_unit: TimestampUnit) -> Self {
        Self {
            infer_unit,
            default_unit,
        }
    }
}

impl Parser for LineParser {
    fn parse(&self, raw: &str) -> Result<Payload, ParseError> {
        let line = raw.trim();
        let sections: Vec<&str> = split_unescaped(line, ' ', true)
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();

        let (series, field_set, timestamp) = match sections.as_slice() {
            [series, fields, timestamp] => (*series, *fields, *timestamp),
            [_] | [_, _] => return Err(ParseError::new("missing field set or timestamp", line)),
            [] => return Err(ParseError::new("empty message", line)),
            [_, _, _, rest @ ..] => {
                return Err(ParseError::new("unexpected trailing data", rest.join(" ").as_str()))
            }
        };

        let mut series_parts = split_unescaped(series, ',', false).into_iter();
        let metric = unescape(series_parts.next().unwrap_or_default());
        if metric.is_empty() {
            return Err(ParseError::new("metric is empty", series));
        }

        let mut tags = BTreeMap::new();
        for pair in series_parts {
            let (key, value) = split_pair(pair)?;
            if value.is_empty() {
                return Err(ParseError::new("tag value is empty", pair));
            }
            tags.insert(key, unescape(&value));
        }

        let mut fields = BTreeMap::new();
        for pair in split_unescaped(field_set, ',', true) {
            let (key, value) = split_pair(pair)?;
            if value.is_empty() {
                return Err(ParseError::new("field value is empty", pair));
            }
            fields.insert(key, unquote(&value));
        }

        let value = parse_timestamp(timestamp)?;
        let unit = if self.infer_unit {
            TimestampUnit::infer(value)
        } else {
            self.default_unit
        };

        Payload::new(metric, tags, fields, value, unit)
    }
}

/// Splits `key=value` on the first unescaped `=`.
fn split_pair(pair: &str) -> Result<(String, String), ParseError> {
    let Some(idx) = find_unescaped(pair, '=') else {
        return Err(ParseError::new("expected key=value", pair));
    };
    let key = unescape(&pair[..idx]);
    if key.is_empty() {
        return Err(ParseError::new("key is empty", pair));
    }
    Ok((key, pair[idx + 1..].to_string()))
}

fn find_unescaped(s: &str, sep: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            return Some(i);
        }
    }
    None
}

/// Splits on `sep` unless it is backslash-escaped or, with `quotes`, inside
/// a double-quoted run.
fn split_unescaped(s: &str, sep: char, quotes: bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if quotes => quoted = !quoted,
            c if c == sep && !quoted => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if matches!(next, ' ' | ',' | '=' | '"' | '\\') {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn unquote(value: &str) -> FieldText {
    match value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    {
        Some(inner) => FieldText::Quoted(unescape(inner)),
        None => FieldText::Bare(unescape(value)),
    }
}
