//! Pipeline value representation
//!
//! Per-attribute pipelines carry typed attribute values; the
//! all-attributes pipeline carries whole messages, and batchers emit
//! lists. One enum covers all three so the operator contract stays
//! uniform.

use sensorlink_core::{AttributeValue, Message};

/// A value travelling through a pipeline slot
#[derive(Debug, Clone)]
pub enum FnValue {
    Attribute(AttributeValue),
    Message(Box<Message>),
    List(Vec<FnValue>),
}

impl FnValue {
    pub fn as_attribute(&self) -> Option<&AttributeValue> {
        match self {
            Self::Attribute(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_attribute(self) -> Option<AttributeValue> {
        match self {
            Self::Attribute(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Message(message) => vec![*message],
            Self::List(items) => items
                .into_iter()
                .flat_map(FnValue::into_messages)
                .collect(),
            Self::Attribute(_) => Vec::new(),
        }
    }
}

impl From<AttributeValue> for FnValue {
    fn from(value: AttributeValue) -> Self {
        Self::Attribute(value)
    }
}

impl From<Message> for FnValue {
    fn from(message: Message) -> Self {
        Self::Message(Box::new(message))
    }
}
