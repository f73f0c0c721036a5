//! Per-call context handed to every operator
//!
//! The context carries the clock reading, the device analog's value
//! provider, the shared network monitor, and the side-effect collectors
//! for alerts and action invocations. Side effects are collected per
//! evaluation and dispatched by the runtime after the pipeline settles,
//! so operators never block on a sink.

use sensorlink_core::{DataItem, DeviceId, DeviceModel, NetworkMonitor, Severity};
use sensorlink_core::types::AttributeValue;
use sensorlink_formula::ValueProvider;

use crate::batch::BatchPersistence;

/// Alert produced by `alertCondition` or `detectDuplicates`
#[derive(Debug, Clone)]
pub struct AlertRequest {
    /// Fully qualified alert format URN
    pub format_urn: String,
    pub severity: Severity,
    pub fields: Vec<DataItem>,
    pub description: Option<String>,
}

/// Action invocation produced by `actionCondition`
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub name: String,
    pub argument: Option<AttributeValue>,
}

/// Borrowed evaluation context for one `apply`/`get` call
pub struct FunctionContext<'a> {
    /// Current time in milliseconds since epoch
    pub now_ms: i64,
    pub device_id: &'a DeviceId,
    pub model: &'a DeviceModel,
    /// Formula value provider (current + in-process attribute values)
    pub values: &'a dyn ValueProvider,
    pub network: &'a NetworkMonitor,
    /// Optional spill store for attribute-value batches
    pub batch_store: Option<&'a dyn BatchPersistence>,
    /// Alerts raised during this evaluation
    pub alerts: &'a mut Vec<AlertRequest>,
    /// Actions requested during this evaluation
    pub actions: &'a mut Vec<ActionRequest>,
}
