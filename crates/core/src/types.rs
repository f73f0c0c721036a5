//! Core type definitions
//!
//! Every value crossing the engine is typed against the device model. The
//! `AttributeValue` enum is the single representation used by pipelines,
//! formulas, and outbound messages; DATETIME values are milliseconds since
//! epoch internally.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device endpoint identifier
///
/// Identifies a directly- or indirectly-connected device for the lifetime
/// of the process. Must be non-empty and free of whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Validation("DeviceId must not be empty".to_string()));
        }
        if id.chars().any(|c| c.is_whitespace()) {
            return Err(Error::Validation(
                "DeviceId must not contain whitespace".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device model URN (e.g. `urn:sensorlink:device:thermostat`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelUrn(String);

impl ModelUrn {
    pub fn new(urn: impl Into<String>) -> Result<Self> {
        let urn = urn.into();
        if !urn.starts_with("urn:") {
            return Err(Error::Validation(format!(
                "ModelUrn must start with 'urn:', got '{}'",
                urn
            )));
        }
        Ok(Self(urn))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Format URN for outbound DATA messages (`{modelUrn}:attributes`)
    pub fn attributes_format(&self) -> String {
        format!("{}:attributes", self.0)
    }

    /// Format URN for an outbound ALERT of the named format
    pub fn alert_format(&self, format_name: &str) -> String {
        format!("{}:{}", self.0, format_name)
    }
}

impl fmt::Display for ModelUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribute type enumeration from the device model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeType {
    Integer,
    Number,
    Boolean,
    String,
    /// Milliseconds since epoch
    Datetime,
    Uri,
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Integer => "INTEGER",
            Self::Number => "NUMBER",
            Self::Boolean => "BOOLEAN",
            Self::String => "STRING",
            Self::Datetime => "DATETIME",
            Self::Uri => "URI",
        };
        write!(f, "{}", s)
    }
}

/// Typed attribute value
///
/// The tagged representation mirrors `AttributeType`. Pipelines cast the
/// output of every policy function back to the attribute's declared type;
/// incompatible casts yield `None` and the offending item is dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Integer(i64),
    Number(f64),
    Boolean(bool),
    String(String),
    /// Milliseconds since epoch
    Datetime(i64),
    Uri(String),
}

impl AttributeValue {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Self::Integer(_) => AttributeType::Integer,
            Self::Number(_) => AttributeType::Number,
            Self::Boolean(_) => AttributeType::Boolean,
            Self::String(_) => AttributeType::String,
            Self::Datetime(_) => AttributeType::Datetime,
            Self::Uri(_) => AttributeType::Uri,
        }
    }

    /// Numeric view used by the formula evaluator
    ///
    /// Booleans map to 1.0/0.0; strings and URIs have no numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Datetime(ms) => Some(*ms as f64),
            Self::String(_) | Self::Uri(_) => None,
        }
    }

    /// Cast to the target attribute type
    ///
    /// Numeric widening and narrowing between INTEGER and NUMBER is
    /// permitted (narrowing truncates); DATETIME accepts any numeric;
    /// STRING and URI interconvert. Anything else is `None`.
    pub fn cast(&self, target: AttributeType) -> Option<AttributeValue> {
        if self.attribute_type() == target {
            return Some(self.clone());
        }
        match (self, target) {
            (Self::Integer(i), AttributeType::Number) => Some(Self::Number(*i as f64)),
            (Self::Number(n), AttributeType::Integer) => {
                if n.is_finite() {
                    Some(Self::Integer(*n as i64))
                } else {
                    None
                }
            }
            (Self::Integer(i), AttributeType::Datetime) => Some(Self::Datetime(*i)),
            (Self::Number(n), AttributeType::Datetime) => {
                if n.is_finite() {
                    Some(Self::Datetime(*n as i64))
                } else {
                    None
                }
            }
            (Self::Datetime(ms), AttributeType::Integer) => Some(Self::Integer(*ms)),
            (Self::Datetime(ms), AttributeType::Number) => Some(Self::Number(*ms as f64)),
            (Self::String(s), AttributeType::Uri) => Some(Self::Uri(s.clone())),
            (Self::Uri(u), AttributeType::String) => Some(Self::String(u.clone())),
            _ => None,
        }
    }

    /// Coerce a JSON wire value into the declared type
    pub fn from_json(target: AttributeType, value: &serde_json::Value) -> Option<AttributeValue> {
        use serde_json::Value;
        match (target, value) {
            (AttributeType::Integer, Value::Number(n)) => {
                n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).map(Self::Integer)
            }
            (AttributeType::Number, Value::Number(n)) => n.as_f64().map(Self::Number),
            (AttributeType::Boolean, Value::Bool(b)) => Some(Self::Boolean(*b)),
            (AttributeType::String, Value::String(s)) => Some(Self::String(s.clone())),
            (AttributeType::Datetime, Value::Number(n)) => {
                n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).map(Self::Datetime)
            }
            (AttributeType::Uri, Value::String(s)) => Some(Self::Uri(s.clone())),
            _ => None,
        }
    }

    /// JSON wire representation
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Value};
        match self {
            Self::Integer(i) => json!(i),
            Self::Number(n) => {
                if n.is_finite() {
                    json!(n)
                } else {
                    Value::Null
                }
            }
            Self::Boolean(b) => json!(b),
            Self::String(s) => json!(s),
            Self::Datetime(ms) => json!(ms),
            Self::Uri(u) => json!(u),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Number(n) => write!(f, "{}", n),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::String(s) => write!(f, "{}", s),
            Self::Datetime(ms) => write!(f, "{}", ms),
            Self::Uri(u) => write!(f, "{}", u),
        }
    }
}

/// Alert severity levels, ordered lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Normal,
    Significant,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::str::FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "NORMAL" => Ok(Self::Normal),
            "SIGNIFICANT" => Ok(Self::Significant),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(Error::Validation(format!("Unknown severity '{}'", other))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::Significant => "SIGNIFICANT",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}
