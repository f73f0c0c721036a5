//! Device analog: per-(endpoint, model) pipeline state
//!
//! The analog owns everything a policy needs at runtime: the last
//! committed and in-process attribute values, the per-slot operator
//! states, the window-expiry table, the computed-metric trigger map, and
//! the all-attributes pipeline slot. One update lock serializes attribute
//! offers, scheduled firing, and reconfiguration.

use sensorlink_core::{
    AttributeValue, DataItem, DeviceId, DeviceModel, Message, NetworkMonitor, Severity,
};
use sensorlink_formula::ValueProvider;
use sensorlink_functions::{
    ActionRequest, AlertRequest, BatchPersistence, DeviceFunction, FnValue, FunctionContext,
    FunctionState, Parameters,
};
use sensorlink_policy::{DevicePolicy, PolicyFunction, ALL_ATTRIBUTES};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::dispatch::ActionDispatcher;
use crate::scheduler::SlideScheduler;

/// Committed and in-process attribute values
///
/// `$(name)` reads the in-process value (falling back to the committed
/// one); `$$(name)` reads the committed value only.
#[derive(Debug, Default)]
pub struct AnalogValues {
    current: HashMap<String, AttributeValue>,
    in_process: HashMap<String, AttributeValue>,
}

impl ValueProvider for AnalogValues {
    fn in_process(&self, attribute: &str) -> Option<f64> {
        self.in_process
            .get(attribute)
            .or_else(|| self.current.get(attribute))
            .and_then(numeric_view)
    }

    fn current(&self, attribute: &str) -> Option<f64> {
        self.current.get(attribute).and_then(numeric_view)
    }
}

/// Numeric view for formulas: typed numerics directly, strings by parse
fn numeric_view(value: &AttributeValue) -> Option<f64> {
    value.as_f64().or_else(|| match value {
        AttributeValue::String(s) | AttributeValue::Uri(s) => s.trim().parse().ok(),
        _ => None,
    })
}

struct StarSlot {
    descriptor: PolicyFunction,
    function: DeviceFunction,
    state: FunctionState,
}

#[derive(Default)]
struct AnalogInner {
    values: AnalogValues,
    policy: Option<Arc<DevicePolicy>>,
    pipeline_data: HashMap<String, Vec<FunctionState>>,
    /// (attribute, slot) -> (expiry_ms, slide_ms)
    window_expiry: HashMap<(String, usize), (i64, i64)>,
    /// Computed-metric attribute -> its trigger set
    triggers: Vec<(String, BTreeSet<String>)>,
    star: Option<StarSlot>,
}

#[derive(Default)]
struct SideEffects {
    alerts: Vec<AlertRequest>,
    actions: Vec<ActionRequest>,
}

/// Result of processing one DATA message's items
pub(crate) struct ProcessedItems {
    pub surviving: Vec<DataItem>,
    pub alerts: Vec<Message>,
}

/// Slot state lookup with self-healing reinitialization
fn slot_state<'i>(
    pipeline_data: &'i mut HashMap<String, Vec<FunctionState>>,
    attribute: &str,
    pipeline: &[PolicyFunction],
    slot: usize,
) -> Option<&'i mut FunctionState> {
    let states = pipeline_data.entry(attribute.to_string()).or_default();
    if states.len() != pipeline.len() {
        *states = pipeline
            .iter()
            .map(|step| {
                step.function()
                    .map(|f| f.initial_state())
                    .unwrap_or_else(|| FunctionState::Value(Default::default()))
            })
            .collect();
    }
    states.get_mut(slot)
}

/// In-process handle binding an endpoint id, its device model, and the
/// policy runtime state
pub struct DeviceAnalog {
    device_id: DeviceId,
    model: Arc<DeviceModel>,
    clock: Arc<dyn Clock>,
    network: NetworkMonitor,
    scheduler: Arc<SlideScheduler>,
    action_dispatcher: Arc<dyn ActionDispatcher>,
    batch_store: Option<Arc<dyn BatchPersistence>>,
    inner: Mutex<AnalogInner>,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DeviceAnalog {
    pub(crate) fn new(
        device_id: DeviceId,
        model: Arc<DeviceModel>,
        clock: Arc<dyn Clock>,
        network: NetworkMonitor,
        action_dispatcher: Arc<dyn ActionDispatcher>,
        batch_store: Option<Arc<dyn BatchPersistence>>,
    ) -> Self {
        Self {
            device_id,
            model,
            clock,
            network,
            scheduler: Arc::new(SlideScheduler::new()),
            action_dispatcher,
            batch_store,
            inner: Mutex::new(AnalogInner::default()),
            driver: std::sync::Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn model(&self) -> &Arc<DeviceModel> {
        &self.model
    }

    pub(crate) fn scheduler(&self) -> &Arc<SlideScheduler> {
        &self.scheduler
    }

    pub(crate) fn set_driver(&self, handle: JoinHandle<()>) {
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(previous) = driver.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Identity of the installed policy as `(id, lastModified)`
    pub(crate) async fn policy_identity(&self) -> Option<(String, i64)> {
        let inner = self.inner.lock().await;
        inner
            .policy
            .as_ref()
            .map(|p| (p.id.clone(), p.last_modified_ms))
    }

    /// Swap the installed policy, draining pending windowed/batched state
    /// into final messages first. Returns the drained messages.
    pub(crate) async fn reconfigure(&self, policy: Option<Arc<DevicePolicy>>) -> Vec<Message> {
        let mut inner = self.inner.lock().await;
        let drained = self.drain_locked(&mut inner);

        inner.pipeline_data.clear();
        inner.window_expiry.clear();
        inner.triggers.clear();
        inner.star = None;
        self.scheduler.clear();

        if let Some(policy) = &policy {
            if policy.enabled {
                self.install_locked(&mut inner, policy);
            } else {
                debug!("Policy {} is disabled; analog runs without pipelines", policy.id);
            }
        }
        inner.policy = policy;

        drained
    }

    fn install_locked(&self, inner: &mut AnalogInner, policy: &Arc<DevicePolicy>) {
        let now = self.clock.now_ms();

        for (attribute, pipeline) in &policy.pipelines {
            if attribute == ALL_ATTRIBUTES {
                continue;
            }

            let mut triggers: BTreeSet<String> = BTreeSet::new();
            for (slot, step) in pipeline.iter().enumerate() {
                let Some(function) = step.function() else {
                    continue;
                };
                let params = Parameters::new(&step.parameters);
                if let Some((window, slide)) = function.window_spec(params) {
                    self.scheduler.register(window, slide, attribute, slot, now);
                }
                if function == DeviceFunction::ComputedMetric {
                    if let Some(source) = params.str("formula") {
                        if let Ok(expr) = sensorlink_formula::parse(source) {
                            triggers.extend(expr.in_process_references());
                        }
                    }
                }
            }
            if !triggers.is_empty() {
                inner.triggers.push((attribute.clone(), triggers));
            }
        }

        if let Some(star) = policy.all_attributes_pipeline() {
            if star.len() > 1 {
                warn!(
                    "Policy {} has {} operators on '*'; only the first is honored",
                    policy.id,
                    star.len()
                );
            }
            if let Some(first) = star.first() {
                if let Some(function) = first.function() {
                    inner.star = Some(StarSlot {
                        descriptor: first.clone(),
                        function,
                        state: function.initial_state(),
                    });
                }
            }
        }
    }

    /// Drain at most one pending value per attribute from windowed or
    /// batched slots, pushing each through the remainder of its pipeline.
    fn drain_locked(&self, inner: &mut AnalogInner) -> Vec<Message> {
        let Some(policy) = inner.policy.clone() else {
            return Vec::new();
        };
        let now = self.clock.now_ms();
        let mut messages = Vec::new();
        let mut effects = SideEffects::default();

        let attributes: Vec<String> = inner.pipeline_data.keys().cloned().collect();
        for attribute in attributes {
            let Some(pipeline) = policy.pipeline(&attribute).map(|p| p.to_vec()) else {
                continue;
            };
            let pending_slot = inner.pipeline_data.get(&attribute).and_then(|states| {
                states.iter().enumerate().find_map(|(slot, state)| match state {
                    FunctionState::Aggregation(_) | FunctionState::Batch(_) => Some(slot),
                    _ => None,
                })
            });
            let Some(slot) = pending_slot else {
                continue;
            };
            if let Some(value) = self.resume_pipeline_locked(
                inner,
                &policy,
                &attribute,
                &pipeline,
                slot,
                &mut effects,
            ) {
                inner.values.current.insert(attribute.clone(), value.clone());
                messages.push(Message::data(
                    self.device_id.clone(),
                    self.model.urn.attributes_format(),
                    now,
                    vec![DataItem::new(attribute.clone(), value)],
                ));
            }
        }

        // A batching all-attributes operator may still hold whole messages
        {
            let AnalogInner { values, star, .. } = &mut *inner;
            if let Some(star_slot) = star.as_mut() {
                if star_slot.function.is_batcher() {
                    let params = Parameters::new(&star_slot.descriptor.parameters);
                    let mut ctx = FunctionContext {
                        now_ms: now,
                        device_id: &self.device_id,
                        model: &self.model,
                        values: &*values,
                        network: &self.network,
                        batch_store: self.batch_store.as_deref(),
                        alerts: &mut effects.alerts,
                        actions: &mut effects.actions,
                    };
                    if let Some(queued) = star_slot.function.get(
                        &mut ctx,
                        ALL_ATTRIBUTES,
                        params,
                        &mut star_slot.state,
                    ) {
                        messages.extend(queued.into_messages());
                    }
                }
            }
        }

        messages.extend(self.settle_effects(effects));
        messages
    }

    /// Per-attribute evaluation entry point for one offered value
    ///
    /// `Some` is the committed value (possibly transformed); `None` means
    /// the pipeline filtered the reading. An attribute without a pipeline
    /// passes through unchanged.
    fn offer_locked(
        &self,
        inner: &mut AnalogInner,
        attribute: &str,
        value: AttributeValue,
        effects: &mut SideEffects,
    ) -> Option<AttributeValue> {
        inner
            .values
            .in_process
            .insert(attribute.to_string(), value.clone());

        let Some(policy) = inner.policy.clone() else {
            return Some(value);
        };
        if !policy.enabled {
            return Some(value);
        }
        let Some(pipeline) = policy.pipeline(attribute).map(|p| p.to_vec()) else {
            return Some(value);
        };
        if pipeline.is_empty() {
            return Some(value);
        }

        self.run_pipeline_locked(inner, attribute, &pipeline, value, 0, effects)
    }

    /// Run `pipeline[start..]`, feeding `value` into slot `start`
    fn run_pipeline_locked(
        &self,
        inner: &mut AnalogInner,
        attribute: &str,
        pipeline: &[PolicyFunction],
        mut value: AttributeValue,
        start: usize,
        effects: &mut SideEffects,
    ) -> Option<AttributeValue> {
        for slot in start..pipeline.len() {
            let step = &pipeline[slot];
            let Some(function) = step.function() else {
                warn!("Pipeline slot {} on '{}' has no operator; stopping", slot, attribute);
                return None;
            };
            let params = Parameters::new(&step.parameters);

            // Window bookkeeping: seed on first use, advance on expiry
            let mut window_expired = false;
            if let Some((window, slide)) = function.window_spec(params) {
                let now = self.clock.now_ms();
                let entry = inner
                    .window_expiry
                    .entry((attribute.to_string(), slot))
                    .or_insert((now + window, slide));
                if entry.0 <= now {
                    window_expired = true;
                    entry.0 += entry.1.max(1);
                }
            }

            let now = self.clock.now_ms();
            let ready = {
                let AnalogInner {
                    values,
                    pipeline_data,
                    ..
                } = &mut *inner;
                let state = slot_state(pipeline_data, attribute, pipeline, slot)?;
                let mut ctx = FunctionContext {
                    now_ms: now,
                    device_id: &self.device_id,
                    model: &self.model,
                    values: &*values,
                    network: &self.network,
                    batch_store: self.batch_store.as_deref(),
                    alerts: &mut effects.alerts,
                    actions: &mut effects.actions,
                };
                function.apply(&mut ctx, attribute, params, state, FnValue::Attribute(value.clone()))
            };

            if !ready && !window_expired {
                return None;
            }

            let produced = {
                let AnalogInner {
                    values,
                    pipeline_data,
                    ..
                } = &mut *inner;
                let state = slot_state(pipeline_data, attribute, pipeline, slot)?;
                let mut ctx = FunctionContext {
                    now_ms: now,
                    device_id: &self.device_id,
                    model: &self.model,
                    values: &*values,
                    network: &self.network,
                    batch_store: self.batch_store.as_deref(),
                    alerts: &mut effects.alerts,
                    actions: &mut effects.actions,
                };
                function.get(&mut ctx, attribute, params, state)
            }?;

            value = self.coerce_produced(attribute, produced)?;
            inner
                .values
                .in_process
                .insert(attribute.to_string(), value.clone());
        }

        Some(value)
    }

    /// Resume a pipeline at `slot` by pulling that slot's pending value
    fn resume_pipeline_locked(
        &self,
        inner: &mut AnalogInner,
        policy: &Arc<DevicePolicy>,
        attribute: &str,
        pipeline: &[PolicyFunction],
        slot: usize,
        effects: &mut SideEffects,
    ) -> Option<AttributeValue> {
        if !policy.enabled {
            return None;
        }
        let step = pipeline.get(slot)?;
        let function = step.function()?;
        let params = Parameters::new(&step.parameters);

        let produced = {
            let AnalogInner {
                values,
                pipeline_data,
                ..
            } = &mut *inner;
            let state = slot_state(pipeline_data, attribute, pipeline, slot)?;
            let mut ctx = FunctionContext {
                now_ms: self.clock.now_ms(),
                device_id: &self.device_id,
                model: &self.model,
                values: &*values,
                network: &self.network,
                batch_store: self.batch_store.as_deref(),
                alerts: &mut effects.alerts,
                actions: &mut effects.actions,
            };
            function.get(&mut ctx, attribute, params, state)
        }?;

        let value = self.coerce_produced(attribute, produced)?;
        inner
            .values
            .in_process
            .insert(attribute.to_string(), value.clone());

        self.run_pipeline_locked(inner, attribute, pipeline, value, slot + 1, effects)
    }

    /// Cast an operator's output back to the attribute's declared type
    fn coerce_produced(&self, attribute: &str, produced: FnValue) -> Option<AttributeValue> {
        let Some(value) = produced.into_attribute() else {
            warn!(
                "Operator on '{}' produced a non-attribute value in an attribute pipeline",
                attribute
            );
            return None;
        };
        let target = self
            .model
            .attribute(attribute)
            .map(|a| a.attribute_type)
            .unwrap_or_else(|| value.attribute_type());
        match value.cast(target) {
            Some(cast) => Some(cast),
            None => {
                warn!(
                    "Value for '{}' cannot be cast to its declared type {}; dropping",
                    attribute, target
                );
                None
            }
        }
    }

    /// Process the items of one DATA message: coerce on ingress, run each
    /// attribute's pipeline, then fire computed metrics whose trigger set
    /// is covered by this batch.
    pub(crate) async fn process_data_items(&self, items: Vec<DataItem>) -> ProcessedItems {
        let mut inner = self.inner.lock().await;
        let mut effects = SideEffects::default();
        let mut updated: BTreeSet<String> = BTreeSet::new();
        let mut surviving = Vec::new();

        for item in items {
            // Resolve aliases to the canonical attribute name
            let (name, declared) = match self.model.attribute(&item.key) {
                Some(attribute) => (attribute.name.clone(), Some(attribute.attribute_type)),
                None => {
                    warn!(
                        "Model {} declares no attribute '{}'; passing item through",
                        self.model.urn, item.key
                    );
                    (item.key.clone(), None)
                }
            };

            let value = match declared {
                Some(target) => match item.value.cast(target) {
                    Some(value) => value,
                    None => {
                        warn!(
                            "Item '{}' of type {} does not coerce to {}; dropping",
                            name,
                            item.value.attribute_type(),
                            target
                        );
                        continue;
                    }
                },
                None => item.value,
            };

            if let Some(committed) = self.offer_locked(&mut inner, &name, value, &mut effects) {
                inner.values.current.insert(name.clone(), committed.clone());
                updated.insert(name.clone());
                surviving.push(DataItem::new(name, committed));
            }
        }

        self.fire_computed_metrics(&mut inner, &mut updated, &mut surviving, &mut effects);

        drop(inner);
        ProcessedItems {
            surviving,
            alerts: self.settle_effects(effects),
        }
    }

    fn fire_computed_metrics(
        &self,
        inner: &mut AnalogInner,
        updated: &mut BTreeSet<String>,
        surviving: &mut Vec<DataItem>,
        effects: &mut SideEffects,
    ) {
        let triggers = inner.triggers.clone();
        for (metric, trigger_set) in triggers {
            if updated.contains(&metric) {
                continue;
            }
            if !trigger_set.iter().all(|t| updated.contains(t)) {
                continue;
            }

            let seed = inner
                .values
                .current
                .get(&metric)
                .cloned()
                .or_else(|| {
                    self.model
                        .attribute(&metric)
                        .and_then(|a| a.default_attribute_value())
                })
                .unwrap_or(AttributeValue::Number(0.0));

            if let Some(committed) = self.offer_locked(inner, &metric, seed, effects) {
                inner.values.current.insert(metric.clone(), committed.clone());
                updated.insert(metric.clone());
                surviving.push(DataItem::new(metric, committed));
            }
        }
    }

    /// Scheduled-slide entry point: pull the windowed slot and run the
    /// remaining pipeline. Returns the produced data message (if any)
    /// plus operator-raised alert messages.
    pub(crate) async fn fire_scheduled(
        &self,
        attribute: &str,
        slot: usize,
    ) -> (Option<Message>, Vec<Message>) {
        let mut inner = self.inner.lock().await;
        let Some(policy) = inner.policy.clone() else {
            return (None, Vec::new());
        };
        let Some(pipeline) = policy.pipeline(attribute).map(|p| p.to_vec()) else {
            return (None, Vec::new());
        };

        let mut effects = SideEffects::default();
        let produced = self.resume_pipeline_locked(
            &mut inner,
            &policy,
            attribute,
            &pipeline,
            slot,
            &mut effects,
        );

        let message = match produced {
            Some(value) => {
                let now = self.clock.now_ms();
                inner.values.current.insert(attribute.to_string(), value.clone());

                // Keep the traffic-driven expiry aligned with this firing
                if let Some(step) = pipeline.get(slot) {
                    if let Some(function) = step.function() {
                        if let Some((_, slide)) =
                            function.window_spec(Parameters::new(&step.parameters))
                        {
                            inner
                                .window_expiry
                                .insert((attribute.to_string(), slot), (now + slide, slide));
                        }
                    }
                }

                let mut updated: BTreeSet<String> = BTreeSet::new();
                updated.insert(attribute.to_string());
                let mut items = vec![DataItem::new(attribute.to_string(), value)];
                self.fire_computed_metrics(&mut inner, &mut updated, &mut items, &mut effects);

                Some(Message::data(
                    self.device_id.clone(),
                    self.model.urn.attributes_format(),
                    now,
                    items,
                ))
            }
            None => None,
        };

        drop(inner);
        (message, self.settle_effects(effects))
    }

    /// Run a finished message through the all-attributes pipeline
    ///
    /// Only the first operator is honored. An alert at or above the
    /// severity threshold bypasses a batching operator and flushes its
    /// queue alongside the alert.
    pub(crate) async fn apply_model_pipeline(&self, message: Message) -> Vec<Message> {
        let mut inner = self.inner.lock().await;
        let mut effects = SideEffects::default();
        let now = self.clock.now_ms();

        let mut output = {
            let AnalogInner { values, star, .. } = &mut *inner;
            match star.as_mut() {
                None => vec![message],
                Some(star) => {
                    let params = Parameters::new(&star.descriptor.parameters);
                    let override_severity = params
                        .str("alertSeverity")
                        .and_then(|s| s.parse::<Severity>().ok())
                        .unwrap_or(Severity::Critical);

                    let mut ctx = FunctionContext {
                        now_ms: now,
                        device_id: &self.device_id,
                        model: &self.model,
                        values: &*values,
                        network: &self.network,
                        batch_store: self.batch_store.as_deref(),
                        alerts: &mut effects.alerts,
                        actions: &mut effects.actions,
                    };

                    if star.function.is_batcher()
                        && message.severity().is_some_and(|s| s >= override_severity)
                    {
                        // Severity override: flush the queue with the alert
                        let mut flushed = star
                            .function
                            .get(&mut ctx, ALL_ATTRIBUTES, params, &mut star.state)
                            .map(FnValue::into_messages)
                            .unwrap_or_default();
                        flushed.push(message);
                        flushed
                    } else {
                        let ready = star.function.apply(
                            &mut ctx,
                            ALL_ATTRIBUTES,
                            params,
                            &mut star.state,
                            FnValue::Message(Box::new(message)),
                        );
                        if ready {
                            star.function
                                .get(&mut ctx, ALL_ATTRIBUTES, params, &mut star.state)
                                .map(FnValue::into_messages)
                                .unwrap_or_default()
                        } else {
                            Vec::new()
                        }
                    }
                }
            }
        };

        drop(inner);
        output.extend(self.settle_effects(effects));
        output
    }

    /// Convert collected side effects: actions go to the dispatcher,
    /// alerts become outbound ALERT messages.
    fn settle_effects(&self, effects: SideEffects) -> Vec<Message> {
        for action in effects.actions {
            self.action_dispatcher.invoke(&self.device_id, action);
        }

        let now = self.clock.now_ms();
        effects
            .alerts
            .into_iter()
            .map(|request| {
                let mut message = Message::alert(
                    self.device_id.clone(),
                    request.format_urn,
                    now,
                    request.severity,
                    request.fields,
                );
                if let sensorlink_core::MessageKind::Alert(payload) = &mut message.kind {
                    payload.description = request.description;
                }
                message
            })
            .collect()
    }
}

impl Drop for DeviceAnalog {
    fn drop(&mut self) {
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                handle.abort();
            }
        }
    }
}
