//! Tolerant decoding of sensor payloads.
//!
//! The sensor firmware formats floats with its own printer, so a failed reading shows up
//! as a bare `nan` (or `inf`) token that is not valid JSON, and a runaway reading can
//! overflow `f64`. Decoding first tries strict JSON and only then rewrites those values to
//! `null`.

use std::sync::LazyLock;

use chrono::{DateTime, Local};
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::telemetry::Metric;

/// A nonstandard float token used as a value, i.e. after `:` and before `,` or `}`.
static NONSTANDARD_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i):(\s*)[-+]?(?:infinity|inf|nan)(\s*)([,}])")
        .expect("nonstandard number pattern is valid")
});

/// A JSON number literal used as a value.
static NUMBER_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r":(\s*)(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)(\s*)([,}])")
        .expect("number literal pattern is valid")
});

/// Outcome of validating one optional payload field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field {
    /// Key not present in the payload
    Absent,
    /// Present, but null, NaN, infinite or not numeric
    Invalid,
    Value(f64),
}

impl Field {
    pub fn value(self) -> Option<f64> {
        match self {
            Field::Value(value) => Some(value),
            Field::Absent | Field::Invalid => None,
        }
    }

    pub fn is_present(self) -> bool {
        !matches!(self, Field::Absent)
    }
}

/// The metric fields of one payload, each validated on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedPayload {
    pub temperature: Field,
    pub humidity: Field,
    pub gas_raw: Field,
    /// Nonstandard tokens had to be rewritten before the payload parsed
    pub sanitized: bool,
}

impl DecodedPayload {
    pub fn field(&self, metric: Metric) -> Field {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
            Metric::Gas => self.gas_raw,
        }
    }

    pub fn has_valid_metric(&self) -> bool {
        Metric::ALL
            .iter()
            .any(|metric| self.field(*metric).value().is_some())
    }

    /// Readings for every valid field, stamped with `timestamp`.
    pub fn readings(&self, timestamp: DateTime<Local>) -> Vec<Reading> {
        Metric::ALL
            .iter()
            .filter_map(|metric| {
                self.field(*metric).value().map(|value| Reading {
                    timestamp,
                    metric: *metric,
                    value,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Local>,
    pub metric: Metric,
    pub value: f64,
}

pub fn decode(payload: &str) -> Result<DecodedPayload, DecodeError> {
    let (document, sanitized) = match serde_json::from_str::<Value>(payload) {
        Ok(document) => (document, false),
        Err(first) => {
            let rewritten = sanitize_nonstandard_numbers(payload);
            match serde_json::from_str::<Value>(&rewritten) {
                Ok(document) => (document, true),
                Err(_) => return Err(DecodeError::Malformed(first.to_string())),
            }
        }
    };

    let Value::Object(object) = document else {
        return Err(DecodeError::NotAnObject);
    };

    Ok(DecodedPayload {
        temperature: read_field(&object, Metric::Temperature.field_name()),
        humidity: read_field(&object, Metric::Humidity.field_name()),
        gas_raw: read_field(&object, Metric::Gas.field_name()),
        sanitized,
    })
}

/// Rewrites `nan`, `inf` and `infinity` values (any case, optional sign) and number
/// literals beyond the `f64` range to `null`.
pub fn sanitize_nonstandard_numbers(payload: &str) -> String {
    let tokens = NONSTANDARD_NUMBER.replace_all(payload, ":${1}null${2}${3}");
    NUMBER_LITERAL
        .replace_all(&tokens, |caps: &Captures| {
            let literal = &caps[2];
            match literal.parse::<f64>() {
                Ok(number) if number.is_finite() => caps[0].to_string(),
                _ => format!(":{}null{}{}", &caps[1], &caps[3], &caps[4]),
            }
        })
        .into_owned()
}

fn read_field(object: &Map<String, Value>, key: &str) -> Field {
    match object.get(key) {
        None => Field::Absent,
        Some(value) => match to_finite(value) {
            Some(number) => Field::Value(number),
            None => Field::Invalid,
        },
    }
}

fn to_finite(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}
