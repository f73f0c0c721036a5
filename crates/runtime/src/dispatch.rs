//! Outbound collaborator traits
//!
//! The dispatcher that ships finished messages and the handler that
//! executes device actions are both external to the engine; defaults log
//! and drop so the engine runs standalone.

use sensorlink_core::{DeviceId, Message};
use sensorlink_functions::ActionRequest;
use tracing::info;

/// Receives the messages produced by scheduled slides
///
/// Messages returned from `apply_policies` go back to the caller; only
/// the scheduler, which has no caller, pushes through this trait.
pub trait MessageDispatcher: Send + Sync {
    fn dispatch(&self, messages: Vec<Message>);
}

/// Executes a device action requested by `actionCondition`
pub trait ActionDispatcher: Send + Sync {
    fn invoke(&self, device: &DeviceId, request: ActionRequest);
}

/// Default action handler: logs the request and drops it
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingActionDispatcher;

impl ActionDispatcher for LoggingActionDispatcher {
    fn invoke(&self, device: &DeviceId, request: ActionRequest) {
        info!(
            "Action '{}' requested on {} (argument: {:?})",
            request.name, device, request.argument
        );
    }
}
