//! Messaging adapter: `apply_policies`
//!
//! The entry point the client library calls with every outbound message.
//! DATA messages are split per item and run through the per-attribute
//! pipelines; the survivors are rebuilt into a message and pushed through
//! the all-attributes device-model pipeline. ALERT and every other kind
//! go straight to the all-attributes pipeline. Messages drained from
//! replaced policies are prepended to the output.

use sensorlink_core::{DeviceId, DeviceModel, Message, MessageKind, ModelUrn, NetworkMonitor};
use sensorlink_functions::BatchPersistence;
use sensorlink_policy::{ChangeListener, DevicePolicy, ListenerId, PolicyManager};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tracing::debug;

use crate::analog::DeviceAnalog;
use crate::clock::{Clock, SystemClock};
use crate::dispatch::{ActionDispatcher, LoggingActionDispatcher, MessageDispatcher};
use crate::scheduler::spawn_driver;

/// Assignment change queued by the manager's listener, applied before
/// the runtime re-enters the affected analog
struct PendingChange {
    devices: Vec<DeviceId>,
    model_urn: ModelUrn,
    policy: Option<Arc<DevicePolicy>>,
}

struct AdapterListener {
    pending: Arc<StdMutex<Vec<PendingChange>>>,
}

impl ChangeListener for AdapterListener {
    fn policy_assigned(&self, policy: &Arc<DevicePolicy>, devices: &[DeviceId]) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(PendingChange {
                devices: devices.to_vec(),
                model_urn: policy.model_urn.clone(),
                policy: Some(Arc::clone(policy)),
            });
        }
    }

    fn policy_unassigned(&self, policy: &Arc<DevicePolicy>, devices: &[DeviceId]) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(PendingChange {
                devices: devices.to_vec(),
                model_urn: policy.model_urn.clone(),
                policy: None,
            });
        }
    }
}

/// Adapter construction parameters; only the manager and dispatcher are
/// required
pub struct MessagingAdapterConfig {
    pub manager: Arc<PolicyManager>,
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub clock: Arc<dyn Clock>,
    pub network: NetworkMonitor,
    pub action_dispatcher: Arc<dyn ActionDispatcher>,
    pub batch_store: Option<Arc<dyn BatchPersistence>>,
}

impl MessagingAdapterConfig {
    pub fn new(manager: Arc<PolicyManager>, dispatcher: Arc<dyn MessageDispatcher>) -> Self {
        Self {
            manager,
            dispatcher,
            clock: Arc::new(SystemClock),
            network: NetworkMonitor::from_env(),
            action_dispatcher: Arc::new(LoggingActionDispatcher),
            batch_store: None,
        }
    }
}

/// Outbound policy application
pub struct MessagingAdapter {
    manager: Arc<PolicyManager>,
    dispatcher: Arc<dyn MessageDispatcher>,
    clock: Arc<dyn Clock>,
    network: NetworkMonitor,
    action_dispatcher: Arc<dyn ActionDispatcher>,
    batch_store: Option<Arc<dyn BatchPersistence>>,
    models: RwLock<HashMap<String, Arc<DeviceModel>>>,
    analogs: RwLock<HashMap<(DeviceId, String), Arc<DeviceAnalog>>>,
    pending: Arc<StdMutex<Vec<PendingChange>>>,
    listener: ListenerId,
}

impl MessagingAdapter {
    pub fn new(config: MessagingAdapterConfig) -> Self {
        let pending = Arc::new(StdMutex::new(Vec::new()));
        let listener = config.manager.add_change_listener(Arc::new(AdapterListener {
            pending: Arc::clone(&pending),
        }));

        Self {
            manager: config.manager,
            dispatcher: config.dispatcher,
            clock: config.clock,
            network: config.network,
            action_dispatcher: config.action_dispatcher,
            batch_store: config.batch_store,
            models: RwLock::new(HashMap::new()),
            analogs: RwLock::new(HashMap::new()),
            pending,
            listener,
        }
    }

    /// Register a device model so messages against it can be evaluated
    ///
    /// Messages for unregistered models pass through untouched.
    pub async fn register_model(&self, model: Arc<DeviceModel>) {
        let mut models = self.models.write().await;
        models.insert(model.urn.as_str().to_string(), model);
    }

    /// Apply the configured policies to one outbound message
    pub async fn apply_policies(&self, message: Message) -> Vec<Message> {
        let mut output = self.drain_pending().await;

        match &message.kind {
            MessageKind::Data(payload) => {
                let Some(model) = self.model_for_format(&payload.format).await else {
                    debug!(
                        "No registered model for format '{}'; passing message through",
                        payload.format
                    );
                    output.push(message);
                    return output;
                };

                let device = message.source.clone();
                let policy = self.manager.get_policy(&model.urn, &device).await;
                let analog = self.analog(&device, &model).await;

                let desired = policy
                    .as_ref()
                    .map(|p| (p.id.clone(), p.last_modified_ms));
                if analog.policy_identity().await != desired {
                    output.extend(analog.reconfigure(policy).await);
                }

                let items = payload.items.clone();
                let processed = analog.process_data_items(items).await;

                if processed.surviving.is_empty() {
                    debug!("Every item was filtered; message suppressed");
                } else {
                    let rebuilt = message.with_items(processed.surviving);
                    output.extend(analog.apply_model_pipeline(rebuilt).await);
                }
                output.extend(processed.alerts);
            }
            MessageKind::Alert(payload) => {
                let format = payload.format.clone();
                let Some(model) = self.model_for_format(&format).await else {
                    output.push(message);
                    return output;
                };
                let key = (message.source.clone(), model.urn.as_str().to_string());
                let analog = {
                    let analogs = self.analogs.read().await;
                    analogs.get(&key).cloned()
                };
                match analog {
                    Some(analog) => output.extend(analog.apply_model_pipeline(message).await),
                    None => output.push(message),
                }
            }
        }

        output
    }

    /// Drop every analog and its driver task
    pub async fn shutdown(&self) {
        self.analogs.write().await.clear();
    }

    async fn drain_pending(&self) -> Vec<Message> {
        let pending: Vec<PendingChange> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if pending.is_empty() {
            return Vec::new();
        }

        let mut drained = Vec::new();
        for change in pending {
            for device in &change.devices {
                let key = (device.clone(), change.model_urn.as_str().to_string());
                let analog = {
                    let analogs = self.analogs.read().await;
                    analogs.get(&key).cloned()
                };
                let Some(analog) = analog else {
                    continue;
                };
                let desired = change
                    .policy
                    .as_ref()
                    .map(|p| (p.id.clone(), p.last_modified_ms));
                if analog.policy_identity().await != desired {
                    drained.extend(analog.reconfigure(change.policy.clone()).await);
                }
            }
        }
        drained
    }

    async fn model_for_format(&self, format: &str) -> Option<Arc<DeviceModel>> {
        let models = self.models.read().await;
        if let Some(urn) = format.strip_suffix(":attributes") {
            if let Some(model) = models.get(urn) {
                return Some(Arc::clone(model));
            }
        }
        models
            .values()
            .find(|model| {
                format
                    .strip_prefix(model.urn.as_str())
                    .is_some_and(|rest| rest.starts_with(':'))
            })
            .cloned()
    }

    async fn analog(&self, device: &DeviceId, model: &Arc<DeviceModel>) -> Arc<DeviceAnalog> {
        let key = (device.clone(), model.urn.as_str().to_string());
        {
            let analogs = self.analogs.read().await;
            if let Some(analog) = analogs.get(&key) {
                return Arc::clone(analog);
            }
        }

        let mut analogs = self.analogs.write().await;
        if let Some(analog) = analogs.get(&key) {
            return Arc::clone(analog);
        }

        let analog = Arc::new(DeviceAnalog::new(
            device.clone(),
            Arc::clone(model),
            Arc::clone(&self.clock),
            self.network.clone(),
            Arc::clone(&self.action_dispatcher),
            self.batch_store.clone(),
        ));
        let handle = spawn_driver(
            Arc::downgrade(&analog),
            Arc::clone(&self.clock),
            Arc::clone(&self.dispatcher),
        );
        analog.set_driver(handle);
        analogs.insert(key, Arc::clone(&analog));
        analog
    }
}

impl Drop for MessagingAdapter {
    fn drop(&mut self) {
        self.manager.remove_change_listener(self.listener);
    }
}
