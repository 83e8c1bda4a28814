// ABOUTME: Backend-neutral cell values and primary keys
// ABOUTME: Converts between driver representations and what the sync engine compares and stores

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text layouts accepted for timestamps stored as strings (SQLite, text columns).
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// A single cell value read from or written to a table.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

impl Value {
    /// Interpret the value as a point in time.
    ///
    /// Dates map to midnight, text is parsed with the common SQL layouts.
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Date(date) => date.and_hms_opt(0, 0, 0),
            Value::Text(text) => parse_timestamp(text),
            _ => None,
        }
    }
}

/// Parse a timestamp written as text, falling back to a bare date.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Wall-clock reading of `instant` in `tz`.
///
/// Naive timestamps are wall-clock readings in the host's zone: the anchor a
/// full sync records and values read from zone-aware columns both go through
/// here, so the next threshold compares like with like.
pub fn wall_clock<Tz: TimeZone>(instant: DateTime<Utc>, tz: &Tz) -> NaiveDateTime {
    instant.with_timezone(tz).naive_local()
}

/// Instant a wall-clock reading in `tz` names.
///
/// A reading repeated by a DST fold resolves to the earlier instant; one
/// skipped by a DST gap uses the offset in effect at that reading.
pub fn instant_at<Tz: TimeZone>(wall: NaiveDateTime, tz: &Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&wall).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => {
            let offset = tz.offset_from_utc_datetime(&wall).fix();
            DateTime::from_naive_utc_and_offset(wall - offset, Utc)
        }
    }
}

/// Primary-key value of a row.
///
/// Only integers and text can identify rows; they compare and hash exactly,
/// which set differences between source and destination rely on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Int(i64),
    Text(String),
}

impl PrimaryKey {
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(PrimaryKey::Int(*i)),
            Value::Text(s) => Ok(PrimaryKey::Text(s.clone())),
            Value::Null => bail!("primary key value is NULL"),
            other => bail!("unsupported primary key value {:?}", other),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PrimaryKey::Int(i) => Value::Int(*i),
            PrimaryKey::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(i) => write!(f, "{}", i),
            PrimaryKey::Text(s) => write!(f, "{}", s),
        }
    }
}
