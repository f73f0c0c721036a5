//! Policy manager: the device/model/policy association graph
//!
//! Owns the three-way mapping {device -> model -> policy} under one
//! write-preferring lock, performs lazy remote lookups, applies the
//! server change protocol, keeps the local store in sync, and notifies
//! change listeners once the graph is consistent again.
//!
//! Graph invariant: `by_device[d][m] = Some(p)` iff `d` is a member of
//! `by_model[m][p]`, and `by_policy[p]` exists whenever `p` appears as a
//! value anywhere.

use crate::document::DevicePolicy;
use crate::resource::PolicyResource;
use crate::store::{PolicyStore, StoredAssociations};
use sensorlink_core::{DeviceId, ModelUrn};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Change-protocol operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Changed,
    Assigned,
    Unassigned,
}

impl ChangeOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "changed" => Some(Self::Changed),
            "assigned" => Some(Self::Assigned),
            "unassigned" => Some(Self::Unassigned),
            _ => None,
        }
    }
}

/// One item of an inbound policy-change batch
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyChangeItem {
    #[serde(rename = "deviceModelUrn")]
    pub model_urn: ModelUrn,

    pub id: String,

    #[serde(rename = "lastModified", default)]
    pub last_modified_ms: i64,

    /// Raw operation string; unknown values are logged and skipped
    pub op: String,
}

/// Handle returned by [`PolicyManager::add_change_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Receives assignment changes after the graph is consistent
///
/// Callbacks run outside the mapping lock. A panicking listener is
/// isolated and logged; it never aborts the change batch.
pub trait ChangeListener: Send + Sync {
    fn policy_assigned(&self, policy: &Arc<DevicePolicy>, devices: &[DeviceId]);
    fn policy_unassigned(&self, policy: &Arc<DevicePolicy>, devices: &[DeviceId]);
}

/// Manager construction parameters
#[derive(Debug, Clone)]
pub struct PolicyManagerConfig {
    /// This client's own endpoint id
    pub local_device: DeviceId,
    /// Gateways enumerate their indirectly-connected devices on
    /// `assigned`/`unassigned`; directly-connected clients are their own
    /// affected set
    pub is_gateway: bool,
}

enum Notification {
    Assigned(Arc<DevicePolicy>, Vec<DeviceId>),
    Unassigned(Arc<DevicePolicy>, Vec<DeviceId>),
}

#[derive(Default)]
struct AssociationGraph {
    by_device: HashMap<DeviceId, HashMap<ModelUrn, Option<String>>>,
    by_policy: HashMap<String, Arc<DevicePolicy>>,
    by_model: HashMap<ModelUrn, HashMap<String, HashSet<DeviceId>>>,
}

impl AssociationGraph {
    /// Current entry: outer `None` = never looked up, inner `None` =
    /// "no policy applies" marker
    fn lookup(&self, device: &DeviceId, model: &ModelUrn) -> Option<Option<Arc<DevicePolicy>>> {
        let entry = self.by_device.get(device)?.get(model)?;
        match entry {
            Some(policy_id) => Some(self.by_policy.get(policy_id).cloned()),
            None => Some(None),
        }
    }

    fn devices_for(&self, model: &ModelUrn, policy_id: &str) -> HashSet<DeviceId> {
        self.by_model
            .get(model)
            .and_then(|policies| policies.get(policy_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Bind a device to a policy, returning the previously bound policy
    /// when this is a reassignment
    fn bind(&mut self, device: &DeviceId, policy: &Arc<DevicePolicy>) -> Option<Arc<DevicePolicy>> {
        let model = policy.model_urn.clone();
        let previous = self
            .by_device
            .entry(device.clone())
            .or_default()
            .insert(model.clone(), Some(policy.id.clone()))
            .flatten();

        let replaced = match previous {
            Some(previous_id) if previous_id != policy.id => {
                self.remove_membership(&model, &previous_id, device);
                self.by_policy.get(&previous_id).cloned()
            }
            _ => None,
        };

        self.by_policy.insert(policy.id.clone(), Arc::clone(policy));
        self.by_model
            .entry(model)
            .or_default()
            .entry(policy.id.clone())
            .or_default()
            .insert(device.clone());

        replaced
    }

    /// Record the "no policy applies" marker, dropping any stale binding
    fn record_no_policy(&mut self, device: &DeviceId, model: &ModelUrn) {
        let previous = self
            .by_device
            .entry(device.clone())
            .or_default()
            .insert(model.clone(), None)
            .flatten();
        if let Some(previous_id) = previous {
            self.remove_membership(model, &previous_id, device);
            self.gc_policy(&previous_id, model);
        }
    }

    /// Drop a device's binding entirely (next lookup re-synchronizes)
    fn unbind(&mut self, device: &DeviceId, model: &ModelUrn) -> Option<String> {
        let removed = self
            .by_device
            .get_mut(device)
            .and_then(|models| models.remove(model))
            .flatten();
        if let Some(policy_id) = &removed {
            self.remove_membership(model, policy_id, device);
        }
        removed
    }

    fn remove_membership(&mut self, model: &ModelUrn, policy_id: &str, device: &DeviceId) {
        if let Some(policies) = self.by_model.get_mut(model) {
            if let Some(devices) = policies.get_mut(policy_id) {
                devices.remove(device);
                if devices.is_empty() {
                    policies.remove(policy_id);
                }
            }
            if policies.is_empty() {
                self.by_model.remove(model);
            }
        }
    }

    /// Drop the cached document once nothing is bound to it
    fn gc_policy(&mut self, policy_id: &str, model: &ModelUrn) -> bool {
        let still_bound = self
            .by_model
            .get(model)
            .is_some_and(|policies| policies.contains_key(policy_id));
        if !still_bound {
            self.by_policy.remove(policy_id);
        }
        !still_bound
    }

    /// Void every binding for a model; used when the server cannot be
    /// consulted and local state can no longer be trusted
    fn drop_model_bindings(&mut self, model: &ModelUrn) -> Vec<(Arc<DevicePolicy>, Vec<DeviceId>)> {
        let mut dropped = Vec::new();
        let policies = self.by_model.remove(model).unwrap_or_default();
        for (policy_id, devices) in policies {
            for device in &devices {
                if let Some(models) = self.by_device.get_mut(device) {
                    models.remove(model);
                }
            }
            if let Some(policy) = self.by_policy.remove(&policy_id) {
                dropped.push((policy, devices.into_iter().collect()));
            }
        }
        // None-markers for the model also go; they were cached against
        // server state we can no longer verify
        for models in self.by_device.values_mut() {
            models.remove(model);
        }
        dropped
    }

    fn to_stored(&self) -> StoredAssociations {
        let mut stored = StoredAssociations::default();
        for (model, policies) in &self.by_model {
            let mut ids: Vec<String> = policies.keys().cloned().collect();
            ids.sort();
            stored
                .policies_by_model
                .insert(model.as_str().to_string(), ids);
            for (policy_id, devices) in policies {
                let mut names: Vec<String> =
                    devices.iter().map(|d| d.as_str().to_string()).collect();
                names.sort();
                stored
                    .devices_by_policy
                    .entry(policy_id.clone())
                    .or_default()
                    .extend(names);
            }
        }
        stored
    }

    /// Round-trip invariant check (exposed for tests)
    fn verify(&self) -> Result<(), String> {
        for (device, models) in &self.by_device {
            for (model, entry) in models {
                if let Some(policy_id) = entry {
                    if !self.by_policy.contains_key(policy_id) {
                        return Err(format!("by_policy missing {}", policy_id));
                    }
                    let member = self
                        .by_model
                        .get(model)
                        .and_then(|p| p.get(policy_id))
                        .is_some_and(|devices| devices.contains(device));
                    if !member {
                        return Err(format!(
                            "{} bound to {} but absent from by_model",
                            device, policy_id
                        ));
                    }
                }
            }
        }
        for (model, policies) in &self.by_model {
            for (policy_id, devices) in policies {
                if !self.by_policy.contains_key(policy_id) {
                    return Err(format!("by_policy missing {}", policy_id));
                }
                for device in devices {
                    let bound = self
                        .by_device
                        .get(device)
                        .and_then(|models| models.get(model))
                        .and_then(|entry| entry.as_ref())
                        .is_some_and(|id| id == policy_id);
                    if !bound {
                        return Err(format!(
                            "by_model lists {} for {} but by_device disagrees",
                            device, policy_id
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Policy manager
pub struct PolicyManager {
    config: PolicyManagerConfig,
    resource: Arc<dyn PolicyResource>,
    store: PolicyStore,
    graph: RwLock<AssociationGraph>,
    listeners: Mutex<Vec<(u64, Arc<dyn ChangeListener>)>>,
    next_listener: AtomicU64,
}

impl PolicyManager {
    /// Create a manager, rehydrating the association graph from the
    /// local store. Missing or unreadable policy files simply drop their
    /// bindings; the next `get_policy` re-fetches.
    pub fn new(
        config: PolicyManagerConfig,
        resource: Arc<dyn PolicyResource>,
        store: PolicyStore,
    ) -> Self {
        let mut graph = AssociationGraph::default();

        if let Some(stored) = store.load_associations() {
            for (policy_id, devices) in &stored.devices_by_policy {
                let Some(policy) = store.load_policy(policy_id) else {
                    debug!("Persisted policy {} absent; binding dropped", policy_id);
                    continue;
                };
                let policy = Arc::new(policy);
                for device in devices {
                    match DeviceId::new(device.clone()) {
                        Ok(device) => {
                            graph.bind(&device, &policy);
                        }
                        Err(e) => warn!("Persisted device id '{}' invalid: {}", device, e),
                    }
                }
            }
            info!(
                "Policy store rehydrated: {} policies, {} devices",
                graph.by_policy.len(),
                graph.by_device.len()
            );
        }

        Self {
            config,
            resource,
            store,
            graph: RwLock::new(graph),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Register a change listener; returns the removal handle
    pub fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }
        ListenerId(id)
    }

    pub fn remove_change_listener(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(listener_id, _)| *listener_id != id.0);
        }
    }

    /// The policy currently applying to `(model, device)`
    ///
    /// Fast path is a read share of the mapping lock; a miss performs a
    /// remote lookup under the write share, installs the result, and
    /// emits `policy_assigned`. A cached "no policy" marker
    /// short-circuits without network traffic. Remote failures return
    /// `None` without caching so a later call retries.
    pub async fn get_policy(
        &self,
        model: &ModelUrn,
        device: &DeviceId,
    ) -> Option<Arc<DevicePolicy>> {
        {
            let graph = self.graph.read().await;
            if let Some(entry) = graph.lookup(device, model) {
                return entry;
            }
        }

        let mut notifications = Vec::new();
        let result = {
            let mut graph = self.graph.write().await;
            // Another task may have installed the entry while we waited
            if let Some(entry) = graph.lookup(device, model) {
                return entry;
            }

            match self.resource.find_policy_for_device(model, device).await {
                Ok(Some(policy)) => {
                    let policy = Arc::new(policy);
                    graph.bind(device, &policy);
                    self.store.save_policy(&policy);
                    self.store.save_associations(&graph.to_stored());
                    notifications.push(Notification::Assigned(
                        Arc::clone(&policy),
                        vec![device.clone()],
                    ));
                    Some(policy)
                }
                Ok(None) => {
                    graph.record_no_policy(device, model);
                    None
                }
                Err(e) => {
                    warn!(
                        "Policy lookup for {} on {} failed: {}; will retry lazily",
                        device, model, e
                    );
                    None
                }
            }
        };

        self.notify(notifications);
        result
    }

    /// Apply an ordered change batch atomically with respect to
    /// `get_policy`. Listener callbacks fire after the whole batch, in
    /// item order.
    pub async fn policy_changed(&self, device: &DeviceId, items: &[PolicyChangeItem]) {
        let mut notifications = Vec::new();
        {
            let mut graph = self.graph.write().await;
            for item in items {
                let Some(op) = ChangeOp::parse(&item.op) else {
                    warn!("Unknown policy-change op '{}' for {}; skipping", item.op, item.id);
                    continue;
                };
                match op {
                    ChangeOp::Changed => {
                        self.apply_changed(&mut graph, item, &mut notifications).await
                    }
                    ChangeOp::Assigned => {
                        self.apply_assigned(&mut graph, device, item, &mut notifications)
                            .await
                    }
                    ChangeOp::Unassigned => {
                        self.apply_unassigned(&mut graph, device, item, &mut notifications)
                            .await
                    }
                }
            }
            self.store.save_associations(&graph.to_stored());
        }

        self.notify(notifications);
    }

    async fn apply_changed(
        &self,
        graph: &mut AssociationGraph,
        item: &PolicyChangeItem,
        notifications: &mut Vec<Notification>,
    ) {
        let Some(cached) = graph.by_policy.get(&item.id).cloned() else {
            debug!("Change for uncached policy {}; nothing to refresh", item.id);
            return;
        };
        if cached.last_modified_ms >= item.last_modified_ms {
            debug!(
                "Cached policy {} is current ({} >= {})",
                item.id, cached.last_modified_ms, item.last_modified_ms
            );
            return;
        }

        match self.resource.get_policy(&item.model_urn, &item.id).await {
            Ok(Some(updated)) => {
                let updated = Arc::new(updated);
                graph.by_policy.insert(updated.id.clone(), Arc::clone(&updated));
                self.store.save_policy(&updated);

                let devices: Vec<DeviceId> =
                    graph.devices_for(&item.model_urn, &item.id).into_iter().collect();
                if !devices.is_empty() {
                    // Bound runtimes drain their old state, then pick up
                    // the refreshed document
                    notifications.push(Notification::Unassigned(cached, devices.clone()));
                    notifications.push(Notification::Assigned(updated, devices));
                }
            }
            Ok(None) => warn!("Server no longer serves changed policy {}", item.id),
            Err(e) => warn!("Refresh of changed policy {} failed: {}; staying stale", item.id, e),
        }
    }

    async fn apply_assigned(
        &self,
        graph: &mut AssociationGraph,
        device: &DeviceId,
        item: &PolicyChangeItem,
        notifications: &mut Vec<Notification>,
    ) {
        let policy = match self.resource.get_policy(&item.model_urn, &item.id).await {
            Ok(Some(policy)) => Arc::new(policy),
            Ok(None) => {
                warn!(
                    "Assigned policy {} cannot be fetched; voiding bindings for {}",
                    item.id, item.model_urn
                );
                self.void_model(graph, &item.model_urn, notifications);
                return;
            }
            Err(e) => {
                warn!(
                    "Assigned policy {} fetch failed: {}; voiding bindings for {}",
                    item.id, e, item.model_urn
                );
                self.void_model(graph, &item.model_urn, notifications);
                return;
            }
        };

        let affected: Vec<DeviceId> = if self.config.is_gateway {
            match self
                .resource
                .policy_devices(&item.model_urn, &item.id, &self.config.local_device)
                .await
            {
                Ok(devices) => devices,
                Err(e) => {
                    warn!(
                        "Device enumeration for {} failed: {}; voiding bindings for {}",
                        item.id, e, item.model_urn
                    );
                    self.void_model(graph, &item.model_urn, notifications);
                    return;
                }
            }
        } else {
            vec![device.clone()]
        };

        for affected_device in &affected {
            if let Some(replaced) = graph.bind(affected_device, &policy) {
                notifications.push(Notification::Unassigned(
                    replaced,
                    vec![affected_device.clone()],
                ));
            }
        }
        self.store.save_policy(&policy);
        if !affected.is_empty() {
            info!(
                "Policy {} (lastModified {}) assigned to {} device(s)",
                policy.id,
                chrono::DateTime::from_timestamp_millis(policy.last_modified_ms)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| policy.last_modified_ms.to_string()),
                affected.len()
            );
            notifications.push(Notification::Assigned(policy, affected));
        }
    }

    async fn apply_unassigned(
        &self,
        graph: &mut AssociationGraph,
        device: &DeviceId,
        item: &PolicyChangeItem,
        notifications: &mut Vec<Notification>,
    ) {
        let local: HashSet<DeviceId> = graph.devices_for(&item.model_urn, &item.id);
        if local.is_empty() {
            // The caller itself may hold a stale different-policy binding
            self.heal_bad_mapping(graph, device, item);
            return;
        }

        let server: HashSet<DeviceId> = if self.config.is_gateway {
            match self
                .resource
                .policy_devices(&item.model_urn, &item.id, &self.config.local_device)
                .await
            {
                Ok(devices) => devices.into_iter().collect(),
                Err(e) => {
                    warn!(
                        "Device enumeration for unassignment of {} failed: {}; skipping item",
                        item.id, e
                    );
                    return;
                }
            }
        } else {
            HashSet::new()
        };

        let cached = graph.by_policy.get(&item.id).cloned();
        let mut dropped = Vec::new();

        for target in local.difference(&server) {
            let bound_id = graph
                .by_device
                .get(target)
                .and_then(|models| models.get(&item.model_urn))
                .cloned()
                .flatten();

            match bound_id {
                Some(bound_id) if bound_id == item.id => {
                    // Client wins when its cached copy is newer than the
                    // server's unassignment
                    let client_newer = cached
                        .as_ref()
                        .is_some_and(|c| c.last_modified_ms > item.last_modified_ms);
                    if client_newer {
                        debug!(
                            "Rejecting unassign of {} for {}: local copy is newer",
                            item.id, target
                        );
                        continue;
                    }
                    graph.unbind(target, &item.model_urn);
                    dropped.push(target.clone());
                }
                _ => {
                    // Bound to something other than the policy the server
                    // names: the mapping is bad, clear it so the next
                    // lookup re-synchronizes
                    graph.unbind(target, &item.model_urn);
                    debug!("Cleared mismatched binding for {} on {}", target, item.model_urn);
                }
            }
        }

        if graph.gc_policy(&item.id, &item.model_urn) {
            self.store.remove_policy(&item.id);
        }

        if let (Some(policy), false) = (cached, dropped.is_empty()) {
            info!("Policy {} unassigned from {} device(s)", item.id, dropped.len());
            notifications.push(Notification::Unassigned(policy, dropped));
        }
    }

    /// Self-healing for the caller holding a binding the server
    /// contradicts: a different cached policy id means the mapping is
    /// bad, so the entry is removed outright.
    fn heal_bad_mapping(
        &self,
        graph: &mut AssociationGraph,
        device: &DeviceId,
        item: &PolicyChangeItem,
    ) {
        let bound_id = graph
            .by_device
            .get(device)
            .and_then(|models| models.get(&item.model_urn))
            .cloned()
            .flatten();
        if let Some(bound_id) = bound_id {
            if bound_id != item.id {
                graph.unbind(device, &item.model_urn);
                graph.gc_policy(&bound_id, &item.model_urn);
                debug!(
                    "Cleared bad mapping: {} was bound to {} but server unassigned {}",
                    device, bound_id, item.id
                );
            }
        }
    }

    fn void_model(
        &self,
        graph: &mut AssociationGraph,
        model: &ModelUrn,
        notifications: &mut Vec<Notification>,
    ) {
        for (policy, devices) in graph.drop_model_bindings(model) {
            self.store.remove_policy(&policy.id);
            if !devices.is_empty() {
                notifications.push(Notification::Unassigned(policy, devices));
            }
        }
    }

    fn notify(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn ChangeListener>> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };

        for notification in &notifications {
            for listener in &listeners {
                let outcome = catch_unwind(AssertUnwindSafe(|| match notification {
                    Notification::Assigned(policy, devices) => {
                        listener.policy_assigned(policy, devices)
                    }
                    Notification::Unassigned(policy, devices) => {
                        listener.policy_unassigned(policy, devices)
                    }
                }));
                if outcome.is_err() {
                    warn!("Policy change listener panicked; continuing with remaining listeners");
                }
            }
        }
    }

    /// Verify the association-graph round-trip invariant
    pub async fn check_invariants(&self) -> Result<(), String> {
        self.graph.read().await.verify()
    }
}
