//! End-to-end pipeline scenarios
//!
//! Each test drives the full stack (manager -> adapter -> analog ->
//! scheduler) under a paused tokio clock so window and slide arithmetic
//! is exact.

use async_trait::async_trait;
use sensorlink_core::model::{FormatField, FormatType, ModelFormat};
use sensorlink_core::{
    AttributeType, AttributeValue, DataItem, DeviceId, DeviceModel, Message, ModelAttribute,
    ModelUrn, NetworkCost, NetworkMonitor, Severity,
};
use sensorlink_policy::{
    DevicePolicy, PolicyChangeItem, PolicyManager, PolicyManagerConfig, PolicyResource,
    PolicyStore,
};
use sensorlink_runtime::{MessageDispatcher, MessagingAdapter, MessagingAdapterConfig, TokioClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MODEL_URN: &str = "urn:sensorlink:device:thermostat";

fn model_urn() -> ModelUrn {
    ModelUrn::new(MODEL_URN).unwrap()
}

fn dev(id: &str) -> DeviceId {
    DeviceId::new(id).unwrap()
}

fn number_attribute(name: &str) -> ModelAttribute {
    ModelAttribute {
        name: name.to_string(),
        attribute_type: AttributeType::Number,
        default_value: None,
        alias: None,
        lower_bound: None,
        upper_bound: None,
    }
}

fn test_model() -> Arc<DeviceModel> {
    Arc::new(DeviceModel {
        urn: model_urn(),
        name: Some("Thermostat".to_string()),
        description: None,
        attributes: vec![
            number_attribute("temp"),
            number_attribute("a"),
            number_attribute("b"),
            number_attribute("c"),
            ModelAttribute {
                name: "x".to_string(),
                attribute_type: AttributeType::String,
                default_value: None,
                alias: None,
                lower_bound: None,
                upper_bound: None,
            },
        ],
        actions: vec![],
        formats: vec![ModelFormat {
            urn: format!("{}:tooHot", MODEL_URN),
            name: "tooHot".to_string(),
            format_type: FormatType::Alert,
            fields: vec![FormatField {
                name: "temp".to_string(),
                field_type: AttributeType::Number,
                optional: false,
            }],
        }],
    })
}

fn policy_from(descriptor: serde_json::Value) -> DevicePolicy {
    DevicePolicy::from_descriptor(model_urn(), &descriptor).unwrap()
}

/// Policy resource stub: policies by id, optional per-device assignment
#[derive(Default)]
struct StubResource {
    by_id: Mutex<HashMap<String, DevicePolicy>>,
    by_device: Mutex<HashMap<String, String>>,
}

impl StubResource {
    fn insert(&self, policy: DevicePolicy) {
        self.by_id.lock().unwrap().insert(policy.id.clone(), policy);
    }
}

#[async_trait]
impl PolicyResource for StubResource {
    async fn get_policy(
        &self,
        _model: &ModelUrn,
        policy_id: &str,
    ) -> sensorlink_policy::Result<Option<DevicePolicy>> {
        Ok(self.by_id.lock().unwrap().get(policy_id).cloned())
    }

    async fn find_policy_for_device(
        &self,
        _model: &ModelUrn,
        device: &DeviceId,
    ) -> sensorlink_policy::Result<Option<DevicePolicy>> {
        let id = self.by_device.lock().unwrap().get(device.as_str()).cloned();
        Ok(id.and_then(|id| self.by_id.lock().unwrap().get(&id).cloned()))
    }

    async fn policy_devices(
        &self,
        _model: &ModelUrn,
        _policy_id: &str,
        _gateway: &DeviceId,
    ) -> sensorlink_policy::Result<Vec<DeviceId>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct CollectingDispatcher {
    messages: Mutex<Vec<Message>>,
}

impl MessageDispatcher for CollectingDispatcher {
    fn dispatch(&self, messages: Vec<Message>) {
        self.messages.lock().unwrap().extend(messages);
    }
}

impl CollectingDispatcher {
    fn take(&self) -> Vec<Message> {
        self.messages.lock().unwrap().drain(..).collect()
    }
}

struct Rig {
    resource: Arc<StubResource>,
    manager: Arc<PolicyManager>,
    dispatcher: Arc<CollectingDispatcher>,
    adapter: MessagingAdapter,
    network: NetworkMonitor,
}

async fn rig() -> Rig {
    let resource = Arc::new(StubResource::default());
    let manager = Arc::new(PolicyManager::new(
        PolicyManagerConfig {
            local_device: dev("client-1"),
            is_gateway: false,
        },
        Arc::clone(&resource) as Arc<dyn PolicyResource>,
        PolicyStore::disabled(),
    ));
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let network = NetworkMonitor::new(NetworkCost::Ethernet);

    let mut config = MessagingAdapterConfig::new(
        Arc::clone(&manager),
        Arc::clone(&dispatcher) as Arc<dyn MessageDispatcher>,
    );
    config.clock = Arc::new(TokioClock::starting_at(0));
    config.network = network.clone();

    let adapter = MessagingAdapter::new(config);
    adapter.register_model(test_model()).await;

    Rig {
        resource,
        manager,
        dispatcher,
        adapter,
        network,
    }
}

fn data_message(device: &str, items: Vec<(&str, AttributeValue)>) -> Message {
    Message::data(
        dev(device),
        format!("{}:attributes", MODEL_URN),
        0,
        items
            .into_iter()
            .map(|(k, v)| DataItem::new(k, v))
            .collect(),
    )
}

fn item_value<'m>(message: &'m Message, key: &str) -> Option<&'m AttributeValue> {
    message
        .data_items()?
        .iter()
        .find(|item| item.key == key)
        .map(|item| &item.value)
}

async fn assign(rig: &Rig, device: &str, policy_id: &str, last_modified: i64) {
    rig.manager
        .policy_changed(
            &dev(device),
            &[PolicyChangeItem {
                model_urn: model_urn(),
                id: policy_id.to_string(),
                last_modified_ms: last_modified,
                op: "assigned".to_string(),
            }],
        )
        .await;
}

async fn unassign(rig: &Rig, device: &str, policy_id: &str, last_modified: i64) {
    rig.manager
        .policy_changed(
            &dev(device),
            &[PolicyChangeItem {
                model_urn: model_urn(),
                id: policy_id.to_string(),
                last_modified_ms: last_modified,
                op: "unassigned".to_string(),
            }],
        )
        .await;
}

/// Let spawned driver tasks run to completion of their pending work
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_sliding_mean_scheduler_emissions() {
    let rig = rig().await;
    rig.resource.insert(policy_from(serde_json::json!({
        "id": "p-mean",
        "lastModified": 1,
        "pipelines": [{
            "attributeName": "temp",
            "pipeline": [{"id": "mean", "parameters": {"window": 10000, "slide": 5000}}]
        }]
    })));
    assign(&rig, "dev-1", "p-mean", 1).await;

    for (advance_ms, value) in [(0u64, 10.0), (2500, 20.0), (2500, 30.0), (2500, 40.0)] {
        if advance_ms > 0 {
            tokio::time::advance(Duration::from_millis(advance_ms)).await;
        }
        let out = rig
            .adapter
            .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(value))]))
            .await;
        // The windowed operator absorbs every reading
        assert!(out.is_empty(), "reading unexpectedly passed: {:?}", out);
    }

    // First window closes at t=10000
    tokio::time::advance(Duration::from_millis(2500)).await;
    settle().await;
    let emitted = rig.dispatcher.take();
    assert_eq!(emitted.len(), 1);
    assert_eq!(
        item_value(&emitted[0], "temp"),
        Some(&AttributeValue::Number(25.0))
    );

    // Second window [5000, 15000) holds the 30 and 40
    tokio::time::advance(Duration::from_millis(5000)).await;
    settle().await;
    let emitted = rig.dispatcher.take();
    assert_eq!(emitted.len(), 1);
    assert_eq!(
        item_value(&emitted[0], "temp"),
        Some(&AttributeValue::Number(35.0))
    );

    // An empty window produces nothing
    tokio::time::advance(Duration::from_millis(5000)).await;
    settle().await;
    assert!(rig.dispatcher.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_filter_then_privacy() {
    let rig = rig().await;
    rig.resource.insert(policy_from(serde_json::json!({
        "id": "p-privacy",
        "lastModified": 1,
        "pipelines": [{
            "attributeName": "x",
            "pipeline": [
                {"id": "filterCondition", "parameters": {"condition": "$(x) <= 0"}},
                {"id": "privacyPolicy", "parameters": {"level": "one-way"}}
            ]
        }]
    })));
    assign(&rig, "dev-1", "p-privacy", 1).await;

    // Non-positive reading trips the filter condition and is dropped
    let out = rig
        .adapter
        .apply_policies(data_message(
            "dev-1",
            vec![("x", AttributeValue::String("-1".to_string()))],
        ))
        .await;
    assert!(out.is_empty());

    // Positive reading passes and leaves hashed
    let out = rig
        .adapter
        .apply_policies(data_message(
            "dev-1",
            vec![("x", AttributeValue::String("42".to_string()))],
        ))
        .await;
    assert_eq!(out.len(), 1);
    let Some(AttributeValue::String(hashed)) = item_value(&out[0], "x") else {
        panic!("expected hashed string item");
    };
    // base64url(SHA-256("42")), no padding
    assert_eq!(hashed, "c0dctApWjo2ooEXO0RATfhWfiQrE2og7axfcZRs6gEk");
    assert!(!hashed.contains('='));
}

#[tokio::test(start_paused = true)]
async fn test_computed_metric_trigger() {
    let rig = rig().await;
    rig.resource.insert(policy_from(serde_json::json!({
        "id": "p-metric",
        "lastModified": 1,
        "pipelines": [{
            "attributeName": "c",
            "pipeline": [{"id": "computedMetric", "parameters": {"formula": "$(a) + $(b)"}}]
        }]
    })));
    assign(&rig, "dev-1", "p-metric", 1).await;

    let out = rig
        .adapter
        .apply_policies(data_message(
            "dev-1",
            vec![
                ("a", AttributeValue::Number(1.0)),
                ("b", AttributeValue::Number(2.0)),
            ],
        ))
        .await;

    assert_eq!(out.len(), 1);
    assert_eq!(item_value(&out[0], "a"), Some(&AttributeValue::Number(1.0)));
    assert_eq!(item_value(&out[0], "b"), Some(&AttributeValue::Number(2.0)));
    assert_eq!(item_value(&out[0], "c"), Some(&AttributeValue::Number(3.0)));
}

#[tokio::test(start_paused = true)]
async fn test_partial_trigger_does_not_fire_metric() {
    let rig = rig().await;
    rig.resource.insert(policy_from(serde_json::json!({
        "id": "p-metric",
        "lastModified": 1,
        "pipelines": [{
            "attributeName": "c",
            "pipeline": [{"id": "computedMetric", "parameters": {"formula": "$(a) + $(b)"}}]
        }]
    })));
    assign(&rig, "dev-1", "p-metric", 1).await;

    let out = rig
        .adapter
        .apply_policies(data_message("dev-1", vec![("a", AttributeValue::Number(1.0))]))
        .await;

    assert_eq!(out.len(), 1);
    assert!(item_value(&out[0], "c").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_alert_severity_override_flushes_batch() {
    let rig = rig().await;
    rig.resource.insert(policy_from(serde_json::json!({
        "id": "p-batch",
        "lastModified": 1,
        "pipelines": [{
            "pipeline": [{"id": "batchBySize", "parameters": {"batchSize": 5}}]
        }]
    })));
    assign(&rig, "dev-1", "p-batch", 1).await;

    for value in [1.0, 2.0] {
        let out = rig
            .adapter
            .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(value))]))
            .await;
        assert!(out.is_empty(), "data message escaped the batcher");
    }

    let alert = Message::alert(
        dev("dev-1"),
        format!("{}:tooHot", MODEL_URN),
        0,
        Severity::Critical,
        vec![DataItem::new("temp", AttributeValue::Number(99.0))],
    );
    let out = rig.adapter.apply_policies(alert).await;

    // The two buffered data messages flush alongside the alert
    assert_eq!(out.len(), 3);
    assert!(!out[0].is_alert());
    assert!(!out[1].is_alert());
    assert!(out[2].is_alert());
    assert_eq!(out[2].severity(), Some(Severity::Critical));
}

#[tokio::test(start_paused = true)]
async fn test_normal_alert_is_batched_not_flushed() {
    let rig = rig().await;
    rig.resource.insert(policy_from(serde_json::json!({
        "id": "p-batch",
        "lastModified": 1,
        "pipelines": [{
            "pipeline": [{"id": "batchBySize", "parameters": {"batchSize": 5}}]
        }]
    })));
    assign(&rig, "dev-1", "p-batch", 1).await;

    rig.adapter
        .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(1.0))]))
        .await;

    let alert = Message::alert(
        dev("dev-1"),
        format!("{}:tooHot", MODEL_URN),
        0,
        Severity::Normal,
        vec![],
    );
    // Below the override threshold: the alert joins the batch
    let out = rig.adapter.apply_policies(alert).await;
    assert!(out.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_policy_assigned_mid_stream_and_drain_on_unassign() {
    let rig = rig().await;

    // No policy yet: readings pass through untouched
    for value in [1.0, 2.0, 3.0] {
        let out = rig
            .adapter
            .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(value))]))
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(
            item_value(&out[0], "temp"),
            Some(&AttributeValue::Number(value))
        );
    }

    // Policy arrives mid-stream
    rig.resource.insert(policy_from(serde_json::json!({
        "id": "p-mean",
        "lastModified": 1,
        "pipelines": [{
            "attributeName": "temp",
            "pipeline": [{"id": "mean", "parameters": {"window": 60000}}]
        }]
    })));
    assign(&rig, "dev-1", "p-mean", 1).await;

    // The next readings are absorbed by the windowed operator
    for value in [10.0, 20.0] {
        let out = rig
            .adapter
            .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(value))]))
            .await;
        assert!(out.is_empty());
    }

    // Unassignment drains the pending aggregate into one final message
    unassign(&rig, "dev-1", "p-mean", 2).await;
    let out = rig
        .adapter
        .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(7.0))]))
        .await;

    assert_eq!(out.len(), 2);
    // Drained mean of 10 and 20 is prepended
    assert_eq!(item_value(&out[0], "temp"), Some(&AttributeValue::Number(15.0)));
    // The new reading passes through without a policy
    assert_eq!(item_value(&out[1], "temp"), Some(&AttributeValue::Number(7.0)));
}

#[tokio::test(start_paused = true)]
async fn test_network_cost_gating() {
    let rig = rig().await;
    rig.network.set(NetworkCost::Satellite);
    rig.resource.insert(policy_from(serde_json::json!({
        "id": "p-cost",
        "lastModified": 1,
        "pipelines": [{
            "pipeline": [{"id": "batchByCost", "parameters": {"networkCost": "CELLULAR"}}]
        }]
    })));
    assign(&rig, "dev-1", "p-cost", 1).await;

    for value in [1.0, 2.0] {
        let out = rig
            .adapter
            .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(value))]))
            .await;
        assert!(out.is_empty(), "message escaped while uplink was SATELLITE");
    }

    // Uplink drops to the configured threshold: next offer flushes FIFO
    rig.network.set(NetworkCost::Cellular);
    let out = rig
        .adapter
        .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(3.0))]))
        .await;

    assert_eq!(out.len(), 3);
    assert_eq!(item_value(&out[0], "temp"), Some(&AttributeValue::Number(1.0)));
    assert_eq!(item_value(&out[1], "temp"), Some(&AttributeValue::Number(2.0)));
    assert_eq!(item_value(&out[2], "temp"), Some(&AttributeValue::Number(3.0)));
}

#[tokio::test(start_paused = true)]
async fn test_eliminate_duplicates_end_to_end() {
    let rig = rig().await;
    rig.resource.insert(policy_from(serde_json::json!({
        "id": "p-dedup",
        "lastModified": 1,
        "pipelines": [{
            "attributeName": "temp",
            "pipeline": [{"id": "eliminateDuplicates", "parameters": {"window": 60000}}]
        }]
    })));
    assign(&rig, "dev-1", "p-dedup", 1).await;

    let mut survived = 0;
    for _ in 0..4 {
        let out = rig
            .adapter
            .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(5.0))]))
            .await;
        survived += out.len();
    }
    assert_eq!(survived, 1);

    // A distinct value always emits
    let out = rig
        .adapter
        .apply_policies(data_message("dev-1", vec![("temp", AttributeValue::Number(6.0))]))
        .await;
    assert_eq!(out.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_model_passes_through() {
    let rig = rig().await;
    let message = Message::data(
        dev("dev-1"),
        "urn:sensorlink:device:unregistered:attributes",
        0,
        vec![DataItem::new("y", AttributeValue::Integer(1))],
    );
    let out = rig.adapter.apply_policies(message).await;
    assert_eq!(out.len(), 1);
}
