//! Message envelope and kind-specific payloads
//!
//! Outbound telemetry is a tagged `MessageKind` over a shared envelope
//! (source, destination, priority, reliability, event time, client id,
//! properties). The policy engine rebuilds DATA messages after pipeline
//! processing and emits ALERT messages as operator side effects.

use crate::types::{AttributeValue, DeviceId, Severity};
use std::collections::HashMap;
use uuid::Uuid;

/// Message priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Lowest,
    Low,
    Medium,
    High,
    Highest,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Delivery reliability requested for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    NoGuarantee,
    BestEffort,
    GuaranteedDelivery,
}

impl Default for Reliability {
    fn default() -> Self {
        Self::BestEffort
    }
}

/// One key/value pair inside a DATA payload or ALERT field set
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    pub key: String,
    pub value: AttributeValue,
}

impl DataItem {
    pub fn new(key: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// DATA payload: a format URN plus the reported items
#[derive(Debug, Clone, PartialEq)]
pub struct DataPayload {
    /// Format URN (`{modelUrn}:attributes`)
    pub format: String,
    pub items: Vec<DataItem>,
}

/// ALERT payload: a format URN, severity, and the alert fields
#[derive(Debug, Clone, PartialEq)]
pub struct AlertPayload {
    /// Fully qualified alert format URN
    pub format: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub fields: Vec<DataItem>,
}

/// Kind-specific message payload
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Data(DataPayload),
    Alert(AlertPayload),
}

/// Outbound message with the shared envelope
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub source: DeviceId,
    pub destination: Option<String>,
    pub client_id: Option<String>,
    pub priority: Priority,
    pub reliability: Reliability,
    /// Event time in milliseconds since epoch
    pub event_time_ms: i64,
    pub properties: HashMap<String, String>,
    pub kind: MessageKind,
}

impl Message {
    /// Build a DATA message with default envelope settings
    pub fn data(
        source: DeviceId,
        format: impl Into<String>,
        event_time_ms: i64,
        items: Vec<DataItem>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination: None,
            client_id: None,
            priority: Priority::default(),
            reliability: Reliability::default(),
            event_time_ms,
            properties: HashMap::new(),
            kind: MessageKind::Data(DataPayload {
                format: format.into(),
                items,
            }),
        }
    }

    /// Build an ALERT message
    pub fn alert(
        source: DeviceId,
        format: impl Into<String>,
        event_time_ms: i64,
        severity: Severity,
        fields: Vec<DataItem>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination: None,
            client_id: None,
            priority: Priority::High,
            reliability: Reliability::GuaranteedDelivery,
            event_time_ms,
            properties: HashMap::new(),
            kind: MessageKind::Alert(AlertPayload {
                format: format.into(),
                description: None,
                severity,
                fields,
            }),
        }
    }

    /// Rebuild this message with a replacement item list, preserving the
    /// envelope. Only meaningful for DATA messages.
    pub fn with_items(&self, items: Vec<DataItem>) -> Self {
        let kind = match &self.kind {
            MessageKind::Data(payload) => MessageKind::Data(DataPayload {
                format: payload.format.clone(),
                items,
            }),
            other => other.clone(),
        };
        Self {
            id: Uuid::new_v4(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            client_id: self.client_id.clone(),
            priority: self.priority,
            reliability: self.reliability,
            event_time_ms: self.event_time_ms,
            properties: self.properties.clone(),
            kind,
        }
    }

    pub fn is_alert(&self) -> bool {
        matches!(self.kind, MessageKind::Alert(_))
    }

    /// Event time as a calendar timestamp
    pub fn event_time(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.event_time_ms)
            .unwrap_or(chrono::DateTime::UNIX_EPOCH)
    }

    /// Alert severity, if this is an ALERT message
    pub fn severity(&self) -> Option<Severity> {
        match &self.kind {
            MessageKind::Alert(payload) => Some(payload.severity),
            _ => None,
        }
    }

    /// Items of a DATA payload, if this is a DATA message
    pub fn data_items(&self) -> Option<&[DataItem]> {
        match &self.kind {
            MessageKind::Data(payload) => Some(&payload.items),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_source() -> DeviceId {
        DeviceId::new("dev-001").unwrap()
    }

    #[test]
    fn test_data_message_builder() {
        let msg = Message::data(
            create_test_source(),
            "urn:sensorlink:device:thermostat:attributes",
            1_700_000_000_000,
            vec![DataItem::new("temperature", AttributeValue::Number(21.5))],
        );

        assert!(!msg.is_alert());
        assert_eq!(msg.priority, Priority::Medium);
        assert_eq!(msg.data_items().unwrap().len(), 1);
    }

    #[test]
    fn test_alert_message_defaults() {
        let msg = Message::alert(
            create_test_source(),
            "urn:sensorlink:device:thermostat:tooHot",
            1_700_000_000_000,
            Severity::Critical,
            vec![],
        );

        assert!(msg.is_alert());
        assert_eq!(msg.severity(), Some(Severity::Critical));
        assert_eq!(msg.priority, Priority::High);
        assert_eq!(msg.reliability, Reliability::GuaranteedDelivery);
    }

    #[test]
    fn test_event_time_conversion() {
        let msg = Message::data(
            create_test_source(),
            "urn:sensorlink:device:thermostat:attributes",
            1_700_000_000_000,
            vec![],
        );
        assert_eq!(msg.event_time().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_with_items_preserves_envelope() {
        let mut msg = Message::data(
            create_test_source(),
            "urn:sensorlink:device:thermostat:attributes",
            42,
            vec![DataItem::new("a", AttributeValue::Integer(1))],
        );
        msg.destination = Some("gateway-7".to_string());
        msg.properties.insert("tenant".to_string(), "t1".to_string());

        let rebuilt = msg.with_items(vec![
            DataItem::new("a", AttributeValue::Integer(1)),
            DataItem::new("b", AttributeValue::Integer(2)),
        ]);

        assert_eq!(rebuilt.destination.as_deref(), Some("gateway-7"));
        assert_eq!(rebuilt.event_time_ms, 42);
        assert_eq!(rebuilt.properties.get("tenant").unwrap(), "t1");
        assert_eq!(rebuilt.data_items().unwrap().len(), 2);
    }
}
