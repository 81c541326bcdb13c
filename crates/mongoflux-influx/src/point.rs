// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v1 Line Protocol points.
//!
//! One encoded point is a single line:
//! ```text
//! measurement,tag=value field=value timestamp
//! ```
//!
//! Measurement names, tag keys and values, and field keys are
//! backslash-escaped; the trailing timestamp is an integer scaled to
//! the precision the batch is written with (the server is told the
//! precision via the `/write` query string).

use std::fmt::{self, Write as _};
use std::str::FromStr;

/// A value carried by an InfluxDB field.
///
/// `Display` produces the Line Protocol encoding: integers take an `i`
/// suffix so the server keeps them integral, strings are double-quoted
/// with embedded `"` and `\` backslash-escaped, and floats and
/// booleans print in their plain textual form.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit floating point.
    Float(f64),
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 string.
    String(String),
    /// Boolean value.
    Boolean(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Integer(n) => write!(f, "{}i", n),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::String(s) => {
                f.write_char('"')?;
                for c in s.chars() {
                    if matches!(c, '"' | '\\') {
                        f.write_char('\\')?;
                    }
                    f.write_char(c)?;
                }
                f.write_char('"')
            }
        }
    }
}

/// Timestamp precision accepted by the v1 `/write` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    /// The query-string value for the `precision` parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Nanoseconds => "ns",
            Precision::Microseconds => "u",
            Precision::Milliseconds => "ms",
            Precision::Seconds => "s",
            Precision::Minutes => "m",
            Precision::Hours => "h",
        }
    }

    /// Nanoseconds per unit of this precision.
    pub fn nanos_per_unit(self) -> i64 {
        match self {
            Precision::Nanoseconds => 1,
            Precision::Microseconds => 1_000,
            Precision::Milliseconds => 1_000_000,
            Precision::Seconds => 1_000_000_000,
            Precision::Minutes => 60 * 1_000_000_000,
            Precision::Hours => 3_600 * 1_000_000_000,
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ns" | "n" => Ok(Precision::Nanoseconds),
            "u" | "us" => Ok(Precision::Microseconds),
            "ms" => Ok(Precision::Milliseconds),
            "s" | "" => Ok(Precision::Seconds),
            "m" => Ok(Precision::Minutes),
            "h" => Ok(Precision::Hours),
            other => Err(format!("invalid precision: {}", other)),
        }
    }
}

/// Characters that take a backslash in measurement names.
const MEASUREMENT_SPECIALS: &[char] = &[',', ' '];
/// Characters that take a backslash in tag keys, tag values, and field
/// keys.
const KEY_SPECIALS: &[char] = &[',', '=', ' '];

/// Append `s` to `out`, backslash-escaping the given characters.
fn push_escaped(out: &mut String, s: &str, specials: &[char]) {
    for c in s.chars() {
        if specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// One time-series datum: name, tags, fields, and a timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Measurement name.
    pub name: String,
    /// Tag key-value pairs (indexed, string-valued).
    pub tags: Vec<(String, String)>,
    /// Field key-value pairs (the actual data).
    pub fields: Vec<(String, FieldValue)>,
    /// Unix timestamp in nanoseconds.
    pub time_ns: i64,
}

impl Point {
    /// Create a point. `fields` must be non-empty; the batch rejects
    /// empty-field points before they reach the wire.
    pub fn new(
        name: impl Into<String>,
        tags: Vec<(String, String)>,
        fields: Vec<(String, FieldValue)>,
        time_ns: i64,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            fields,
            time_ns,
        }
    }

    /// Append this point to `out` as one Line Protocol line, with the
    /// timestamp scaled down to `precision`.
    ///
    /// Tags are emitted in key order so equal points encode
    /// identically regardless of construction order.
    pub fn write_line(&self, out: &mut String, precision: Precision) {
        push_escaped(out, &self.name, MEASUREMENT_SPECIALS);

        let mut tags: Vec<&(String, String)> = self.tags.iter().collect();
        tags.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in tags {
            out.push(',');
            push_escaped(out, key, KEY_SPECIALS);
            out.push('=');
            push_escaped(out, value, KEY_SPECIALS);
        }

        for (i, (key, value)) in self.fields.iter().enumerate() {
            out.push(if i == 0 { ' ' } else { ',' });
            push_escaped(out, key, KEY_SPECIALS);
            out.push('=');
            let _ = write!(out, "{}", value);
        }

        let _ = write!(out, " {}", self.time_ns / precision.nanos_per_unit());
    }
}
