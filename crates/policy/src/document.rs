//! Policy document model and descriptor parsing
//!
//! A device policy is immutable after fetch; server-side edits arrive as
//! whole-document replacements through the change protocol. The document
//! holds one pipeline per attribute plus an optional all-attributes
//! pipeline under the `*` sentinel.

use crate::error::{PolicyError, Result};
use sensorlink_core::ModelUrn;
use sensorlink_functions::DeviceFunction;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Attribute-name sentinel for the all-attributes pipeline
pub const ALL_ATTRIBUTES: &str = "*";

/// One step of a pipeline: a function id plus its raw parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFunction {
    pub id: String,

    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl PolicyFunction {
    /// The resolved operator; parse rejects unknown ids, so this only
    /// returns `None` for documents built by hand.
    pub fn function(&self) -> Option<DeviceFunction> {
        DeviceFunction::from_id(&self.id)
    }
}

/// Wire shape of one pipeline entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PipelineDescriptor {
    #[serde(rename = "attributeName", default, skip_serializing_if = "Option::is_none")]
    attribute_name: Option<String>,

    #[serde(default)]
    pipeline: Vec<PolicyFunction>,
}

/// Wire shape of a fetched policy document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolicyDescriptor {
    id: String,

    #[serde(rename = "deviceModelUrn", default, skip_serializing_if = "Option::is_none")]
    device_model_urn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,

    #[serde(rename = "lastModified", default)]
    last_modified: i64,

    #[serde(default = "default_enabled")]
    enabled: bool,

    #[serde(default)]
    pipelines: Vec<PipelineDescriptor>,
}

fn default_enabled() -> bool {
    true
}

/// Immutable device policy
#[derive(Debug, Clone)]
pub struct DevicePolicy {
    pub id: String,
    pub model_urn: ModelUrn,
    pub description: Option<String>,
    /// Ordered `(attributeName, pipeline)` pairs; `*` is the
    /// all-attributes pipeline
    pub pipelines: Vec<(String, Vec<PolicyFunction>)>,
    /// Milliseconds since epoch
    pub last_modified_ms: i64,
    pub enabled: bool,
}

impl DevicePolicy {
    /// Parse a fetched descriptor
    ///
    /// Unknown function ids are dropped with a warning; special `action`
    /// and `alert` parameter objects are flattened so operators read
    /// their fields directly. Formula parameters are validated here so a
    /// bad formula surfaces at assignment time, not per reading.
    pub fn from_descriptor(model_urn: ModelUrn, descriptor: &Value) -> Result<Self> {
        let descriptor: PolicyDescriptor = serde_json::from_value(descriptor.clone())
            .map_err(|e| PolicyError::Validation(format!("Malformed policy descriptor: {}", e)))?;

        if descriptor.id.is_empty() {
            return Err(PolicyError::Validation("Policy id must not be empty".to_string()));
        }

        let mut pipelines = Vec::new();
        for entry in descriptor.pipelines {
            let attribute = entry
                .attribute_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| ALL_ATTRIBUTES.to_string());

            let mut functions = Vec::new();
            for mut function in entry.pipeline {
                if DeviceFunction::from_id(&function.id).is_none() {
                    warn!(
                        "Policy {} names unknown function '{}' on '{}'; dropping it",
                        descriptor.id, function.id, attribute
                    );
                    continue;
                }
                flatten_parameters(&mut function.parameters);
                validate_formulas(&descriptor.id, &attribute, &function);
                functions.push(function);
            }
            pipelines.push((attribute, functions));
        }

        Ok(Self {
            id: descriptor.id,
            model_urn,
            description: descriptor.description,
            pipelines,
            last_modified_ms: descriptor.last_modified,
            enabled: descriptor.enabled,
        })
    }

    /// Serialize back to the descriptor shape used by the local store
    pub fn to_descriptor(&self) -> Value {
        let pipelines: Vec<PipelineDescriptor> = self
            .pipelines
            .iter()
            .map(|(attribute, functions)| PipelineDescriptor {
                attribute_name: Some(attribute.clone()),
                pipeline: functions.clone(),
            })
            .collect();

        let descriptor = PolicyDescriptor {
            id: self.id.clone(),
            device_model_urn: Some(self.model_urn.as_str().to_string()),
            description: self.description.clone(),
            last_modified: self.last_modified_ms,
            enabled: self.enabled,
            pipelines,
        };
        serde_json::to_value(descriptor).unwrap_or(Value::Null)
    }

    /// Parse a document that came from the local store
    pub fn from_stored(value: &Value) -> Result<Self> {
        let urn = value
            .get("deviceModelUrn")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PolicyError::Validation("Stored policy is missing deviceModelUrn".to_string())
            })?;
        let model_urn =
            ModelUrn::new(urn).map_err(|e| PolicyError::Validation(e.to_string()))?;
        Self::from_descriptor(model_urn, value)
    }

    /// The pipeline for one attribute
    pub fn pipeline(&self, attribute: &str) -> Option<&[PolicyFunction]> {
        self.pipelines
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, functions)| functions.as_slice())
    }

    /// The all-attributes pipeline, if any
    pub fn all_attributes_pipeline(&self) -> Option<&[PolicyFunction]> {
        self.pipeline(ALL_ATTRIBUTES)
    }

    /// Attribute names with their own pipeline (excludes `*`)
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.pipelines
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| *name != ALL_ATTRIBUTES)
    }
}

/// Flatten the special `action` and `alert` parameter objects
///
/// `{action: {name, arguments}}` and `{alert: {urn, fields, severity}}`
/// become top-level keys so operators read them without another lookup.
fn flatten_parameters(parameters: &mut Map<String, Value>) {
    if let Some(Value::Object(action)) = parameters.remove("action") {
        for (key, value) in action {
            parameters.entry(key).or_insert(value);
        }
    }
    if let Some(Value::Object(alert)) = parameters.remove("alert") {
        for (key, value) in alert {
            parameters.entry(key).or_insert(value);
        }
    }
}

/// Best-effort formula validation at parse time
fn validate_formulas(policy_id: &str, attribute: &str, function: &PolicyFunction) {
    let mut check = |source: &str| {
        if let Err(e) = sensorlink_formula::parse(source) {
            warn!(
                "Policy {} has an unparseable formula on '{}' ({}): {}",
                policy_id, attribute, function.id, e
            );
        }
    };

    for key in ["condition", "formula"] {
        if let Some(source) = function.parameters.get(key).and_then(Value::as_str) {
            check(source);
        }
    }
    if let Some(Value::Object(fields)) = function.parameters.get("fields") {
        for source in fields.values().filter_map(Value::as_str) {
            check(source);
        }
    }
    if let Some(Value::Array(arguments)) = function.parameters.get("arguments") {
        for source in arguments.iter().filter_map(Value::as_str) {
            check(source);
        }
    }
}
