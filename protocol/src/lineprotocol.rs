//! InfluxDB line protocol points
//!
//! A point serializes to one line:
//!
//! ```text
//! measurement[,tag=value...] field=value[,field=value...] [timestamp_ms]
//! ```
//!
//! Escaping follows the InfluxDB rules. Measurement names escape commas and
//! spaces. Tag keys, tag values and field keys escape commas, equals signs and
//! spaces. String field values are double-quoted with `"` and `\` escaped.

use crate::error::ProtocolError;
use std::collections::BTreeMap;

/// Typed field payload
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    UInteger(u64),
    Boolean(bool),
    String(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInteger(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::UInteger(v as u64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl FieldValue {
    fn encode(&self, out: &mut String) {
        match self {
            FieldValue::Float(v) => out.push_str(&v.to_string()),
            FieldValue::Integer(v) => {
                out.push_str(&v.to_string());
                out.push('i');
            }
            FieldValue::UInteger(v) => {
                out.push_str(&v.to_string());
                out.push('u');
            }
            FieldValue::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
            FieldValue::String(v) => {
                out.push('"');
                for c in v.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
        }
    }

    fn decode(raw: &str) -> Result<Self, ProtocolError> {
        if let Some(body) = raw.strip_prefix('"') {
            let body = body
                .strip_suffix('"')
                .ok_or_else(|| ProtocolError::Malformed(format!("unterminated string {raw:?}")))?;
            let mut value = String::with_capacity(body.len());
            let mut chars = body.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    match chars.next() {
                        Some(next @ ('"' | '\\')) => value.push(next),
                        Some(next) => {
                            value.push('\\');
                            value.push(next);
                        }
                        None => value.push('\\'),
                    }
                } else {
                    value.push(c);
                }
            }
            return Ok(FieldValue::String(value));
        }

        match raw {
            "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Boolean(true)),
            "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Boolean(false)),
            _ => {}
        }

        let bad = || ProtocolError::Malformed(format!("bad field value {raw:?}"));
        if let Some(int) = raw.strip_suffix('i') {
            return int.parse().map(FieldValue::Integer).map_err(|_| bad());
        }
        if let Some(uint) = raw.strip_suffix('u') {
            return uint.parse().map(FieldValue::UInteger).map_err(|_| bad());
        }
        raw.parse().map(FieldValue::Float).map_err(|_| bad())
    }
}

/// One time-series point
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LineProtocolPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Unix milliseconds
    pub timestamp_ms: Option<i64>,
}

impl LineProtocolPoint {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            ..Default::default()
        }
    }

    /// Adds a tag. Empty values are skipped since line protocol cannot carry them.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_tag(key, value);
        self
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.tags.insert(key.into(), value);
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.add_field(key, value);
        self
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn time_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Checks that the point can be written without corrupting the output
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.measurement.is_empty() {
            return Err(ProtocolError::EmptyMeasurement);
        }
        if self.fields.is_empty() {
            return Err(ProtocolError::NoFields);
        }
        if breaks_line(&self.measurement) {
            return Err(ProtocolError::Malformed("newline in measurement".to_string()));
        }
        for (key, value) in &self.tags {
            if key.is_empty() || value.is_empty() {
                return Err(ProtocolError::EmptyTag(key.clone()));
            }
            if breaks_line(key) || breaks_line(value) {
                return Err(ProtocolError::Malformed(format!("newline in tag {key:?}")));
            }
        }
        for (key, value) in &self.fields {
            if key.is_empty() {
                return Err(ProtocolError::EmptyFieldKey);
            }
            if breaks_line(key) {
                return Err(ProtocolError::Malformed(format!("newline in field {key:?}")));
            }
            match value {
                FieldValue::Float(v) if !v.is_finite() => {
                    return Err(ProtocolError::NonFiniteField(key.clone()));
                }
                FieldValue::String(v) if breaks_line(v) => {
                    return Err(ProtocolError::Malformed(format!("newline in field {key:?}")));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Serializes the point to a single line without the trailing newline
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        self.validate()?;

        let mut line = String::with_capacity(64 + self.tags.len() * 24 + self.fields.len() * 24);
        escape_into(&mut line, &self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            value.encode(&mut line);
        }

        if let Some(ts) = self.timestamp_ms {
            line.push(' ');
            line.push_str(&ts.to_string());
        }

        Ok(line)
    }

    /// Parses one line produced by [`to_line`](Self::to_line) (or any
    /// millisecond-precision line protocol)
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Err(ProtocolError::Malformed("empty line".to_string()));
        }

        let (head, rest) = split_first_unescaped(line, ' ')
            .ok_or_else(|| ProtocolError::Malformed("missing field set".to_string()))?;

        let mut head_parts = split_unescaped(head, ',', false).into_iter();
        let measurement = unescape(head_parts.next().unwrap_or_default());
        let mut point = LineProtocolPoint::new(measurement);

        for raw_tag in head_parts {
            let (key, value) = split_first_unescaped(raw_tag, '=')
                .ok_or_else(|| ProtocolError::Malformed(format!("bad tag {raw_tag:?}")))?;
            point.tags.insert(unescape(key), unescape(value));
        }

        let sections = split_unescaped(rest, ' ', true);
        let (fields, timestamp) = match sections.as_slice() {
            [fields] => (*fields, None),
            [fields, ts] => (*fields, Some(*ts)),
            _ => return Err(ProtocolError::Malformed("too many sections".to_string())),
        };

        for raw_field in split_unescaped(fields, ',', true) {
            let (key, value) = split_first_unescaped(raw_field, '=')
                .ok_or_else(|| ProtocolError::Malformed(format!("bad field {raw_field:?}")))?;
            point.fields.insert(unescape(key), FieldValue::decode(value)?);
        }

        if let Some(ts) = timestamp {
            let ts = ts
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("bad timestamp {ts:?}")))?;
            point.timestamp_ms = Some(ts);
        }

        point.validate()?;
        Ok(point)
    }
}

/// Line protocol has no escape for line breaks
fn breaks_line(s: &str) -> bool {
    s.contains(['\n', '\r'])
}

fn escape_into(out: &mut String, value: &str, specials: &[char]) {
    for c in value.chars() {
        if specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if matches!(next, ',' | '=' | ' ') {
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

/// Splits on `sep` where it is neither backslash-escaped nor inside a quoted string
fn split_unescaped(s: &str, sep: char, respect_quotes: bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' if respect_quotes => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn split_first_unescaped(s: &str, sep: char) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == sep {
            return Some((&s[..i], &s[i + c.len_utf8()..]));
        }
    }
    None
}
