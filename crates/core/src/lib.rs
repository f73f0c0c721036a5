//! # SensorLink Core
//!
//! Common types shared across the SensorLink telemetry policy engine.
//!
//! ## Module Structure
//!
//! - `types`: Attribute types, typed values, identifier newtypes
//! - `model`: Device model structures (attributes, actions, formats)
//! - `message`: Message envelope and kind-specific payloads
//! - `network`: Network cost environment input
//! - `error`: Unified error types

pub mod error;
pub mod message;
pub mod model;
pub mod network;
pub mod types;

pub use error::{Error, Result};
pub use message::{DataItem, Message, MessageKind, Priority, Reliability};
pub use model::{DeviceModel, ModelAction, ModelAttribute, ModelFormat};
pub use network::{NetworkCost, NetworkMonitor};
pub use types::{AttributeType, AttributeValue, DeviceId, ModelUrn, Severity};
