//! Status data model
//!
//! Status values arrive dynamically typed from the upstream monitor. They are
//! normalized into [`StatusValue`], whose sentinel variants stand in for the
//! upstream "no data" and "error" marker strings.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one status item, conventionally `"SUBSYS.FIELD"`
pub type StatusKey = String;

/// One batch of updates as delivered by the monitor
pub type StatusBatch = HashMap<StatusKey, StatusValue>;

/// Projection of the store onto a subscriber's interest set
pub type StatusMap = BTreeMap<StatusKey, StatusValue>;

/// Path that marks a monitor payload as a status batch
pub const STATUS_PATH: &str = "mon.status";

/// Upstream marker strings decoded as [`StatusValue::NoData`]
pub const NO_DATA_MARKERS: &[&str] = &["##NODATA##", "##STATNONE##"];

/// Upstream marker strings decoded as [`StatusValue::Error`]
pub const ERROR_MARKERS: &[&str] = &["##ERROR##", "##STATERROR##"];

/// A single status value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum StatusValue {
    Int(i64),
    Float(f64),
    Text(String),
    /// Key has never been seen, or upstream has no value for it
    NoData,
    /// Upstream reported an error for this key
    Error,
}

impl StatusValue {
    /// True for `NoData` and `Error`
    pub fn is_sentinel(&self) -> bool {
        matches!(self, StatusValue::NoData | StatusValue::Error)
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, StatusValue::NoData)
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StatusValue::Int(i) => Some(*i as f64),
            StatusValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StatusValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for StatusValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StatusValue::NoData,
            serde_json::Value::Bool(b) => StatusValue::Int(i64::from(b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => StatusValue::Int(i),
                None => n.as_f64().map(StatusValue::Float).unwrap_or(StatusValue::Error),
            },
            serde_json::Value::String(s) => StatusValue::from(s),
            other => StatusValue::Text(other.to_string()),
        }
    }
}

impl From<StatusValue> for serde_json::Value {
    fn from(value: StatusValue) -> Self {
        match value {
            StatusValue::Int(i) => serde_json::Value::from(i),
            StatusValue::Float(f) => serde_json::Value::from(f),
            StatusValue::Text(s) => serde_json::Value::String(s),
            StatusValue::NoData => serde_json::Value::String(NO_DATA_MARKERS[0].to_string()),
            StatusValue::Error => serde_json::Value::String(ERROR_MARKERS[0].to_string()),
        }
    }
}

impl From<String> for StatusValue {
    fn from(s: String) -> Self {
        if NO_DATA_MARKERS.contains(&s.as_str()) {
            StatusValue::NoData
        } else if ERROR_MARKERS.contains(&s.as_str()) {
            StatusValue::Error
        } else {
            StatusValue::Text(s)
        }
    }
}

impl From<&str> for StatusValue {
    fn from(s: &str) -> Self {
        StatusValue::from(s.to_string())
    }
}

impl From<i64> for StatusValue {
    fn from(i: i64) -> Self {
        StatusValue::Int(i)
    }
}

impl From<f64> for StatusValue {
    fn from(f: f64) -> Self {
        StatusValue::Float(f)
    }
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Int(i) => write!(f, "{}", i),
            StatusValue::Float(v) => write!(f, "{}", v),
            StatusValue::Text(s) => write!(f, "{}", s),
            StatusValue::NoData => write!(f, "<no data>"),
            StatusValue::Error => write!(f, "<error>"),
        }
    }
}

/// A free-form event delivered on a named channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Channel name, the second dot segment of `path`
    pub channel: String,
    pub path: String,
    pub value: serde_json::Value,
}

impl ChannelEvent {
    /// Build an event from a dotted path, or None when the path has no
    /// channel segment (`<prefix>.<channel>[.<rest>]`)
    pub fn from_path(path: &str, value: serde_json::Value) -> Option<Self> {
        let channel = path.split('.').nth(1)?;
        if channel.is_empty() {
            return None;
        }
        Some(Self {
            channel: channel.to_string(),
            path: path.to_string(),
            value,
        })
    }
}

/// One delivery from the monitor feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub path: String,
    pub value: serde_json::Value,
}

impl Payload {
    /// True when this payload carries a status batch
    pub fn is_status(&self) -> bool {
        self.path == STATUS_PATH
    }

    /// Interpret the value as a status batch
    pub fn into_batch(self) -> eyre::Result<StatusBatch> {
        match self.value {
            serde_json::Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, StatusValue::from(v))).collect()),
            other => Err(eyre::eyre!("status payload is not a mapping: {}", other)),
        }
    }
}
