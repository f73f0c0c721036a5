//! Device model structures
//!
//! A device model is the URN-identified schema a device reports against:
//! ordered attribute declarations, invocable actions, and alert/data
//! formats. Models are immutable once loaded; the loader that fetches the
//! JSON document is an external collaborator.

use crate::types::{AttributeType, AttributeValue, ModelUrn};
use serde::{Deserialize, Serialize};

/// Attribute declaration within a device model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAttribute {
    pub name: String,

    #[serde(rename = "type")]
    pub attribute_type: AttributeType,

    /// Default value applied when the device has not reported yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,

    /// Alternate name accepted on ingress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Lower bound for numeric attributes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<f64>,

    /// Upper bound for numeric attributes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<f64>,
}

impl ModelAttribute {
    /// Coerced default value, if one is declared and representable
    pub fn default_attribute_value(&self) -> Option<AttributeValue> {
        self.default_value
            .as_ref()
            .and_then(|v| AttributeValue::from_json(self.attribute_type, v))
    }
}

/// Action declaration within a device model
///
/// Actions take at most one argument; its type and bounds come from the
/// model and are enforced when a policy invokes the action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAction {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_type: Option<AttributeType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<f64>,
}

/// Format kind: outbound data or alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormatType {
    Data,
    Alert,
}

/// Field declaration within a format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatField {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: AttributeType,

    #[serde(default)]
    pub optional: bool,
}

/// Alert or data format declared by a device model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFormat {
    /// Fully qualified format URN
    pub urn: String,

    pub name: String,

    #[serde(rename = "type")]
    pub format_type: FormatType,

    /// Ordered field declarations
    #[serde(default)]
    pub fields: Vec<FormatField>,
}

/// Immutable device model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceModel {
    pub urn: ModelUrn,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub attributes: Vec<ModelAttribute>,

    #[serde(default)]
    pub actions: Vec<ModelAction>,

    #[serde(default)]
    pub formats: Vec<ModelFormat>,
}

impl DeviceModel {
    /// Look up an attribute by name or alias
    pub fn attribute(&self, name: &str) -> Option<&ModelAttribute> {
        self.attributes
            .iter()
            .find(|a| a.name == name || a.alias.as_deref() == Some(name))
    }

    /// Look up an action by name
    pub fn action(&self, name: &str) -> Option<&ModelAction> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// Look up a format by URN or by short name
    pub fn format(&self, urn_or_name: &str) -> Option<&ModelFormat> {
        self.formats
            .iter()
            .find(|f| f.urn == urn_or_name || f.name == urn_or_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_model() -> DeviceModel {
        DeviceModel {
            urn: ModelUrn::new("urn:sensorlink:device:thermostat").unwrap(),
            name: Some("Thermostat".to_string()),
            description: None,
            attributes: vec![
                ModelAttribute {
                    name: "temperature".to_string(),
                    attribute_type: AttributeType::Number,
                    default_value: Some(serde_json::json!(20.0)),
                    alias: Some("temp".to_string()),
                    lower_bound: Some(-40.0),
                    upper_bound: Some(120.0),
                },
                ModelAttribute {
                    name: "unit".to_string(),
                    attribute_type: AttributeType::String,
                    default_value: None,
                    alias: None,
                    lower_bound: None,
                    upper_bound: None,
                },
            ],
            actions: vec![ModelAction {
                name: "power".to_string(),
                argument_type: Some(AttributeType::Boolean),
                lower_bound: None,
                upper_bound: None,
            }],
            formats: vec![ModelFormat {
                urn: "urn:sensorlink:device:thermostat:tooHot".to_string(),
                name: "tooHot".to_string(),
                format_type: FormatType::Alert,
                fields: vec![FormatField {
                    name: "temperature".to_string(),
                    field_type: AttributeType::Number,
                    optional: false,
                }],
            }],
        }
    }

    #[test]
    fn test_attribute_lookup_by_name_and_alias() {
        let model = create_test_model();
        assert!(model.attribute("temperature").is_some());
        assert!(model.attribute("temp").is_some());
        assert!(model.attribute("humidity").is_none());
    }

    #[test]
    fn test_default_value_coercion() {
        let model = create_test_model();
        let attr = model.attribute("temperature").unwrap();
        assert_eq!(
            attr.default_attribute_value(),
            Some(AttributeValue::Number(20.0))
        );
    }

    #[test]
    fn test_format_lookup() {
        let model = create_test_model();
        assert!(model.format("tooHot").is_some());
        assert!(model
            .format("urn:sensorlink:device:thermostat:tooHot")
            .is_some());
        assert!(model.format("tooCold").is_none());
    }

    #[test]
    fn test_model_deserializes_from_wire_shape() {
        let json = serde_json::json!({
            "urn": "urn:sensorlink:device:meter",
            "attributes": [
                {"name": "reading", "type": "NUMBER"}
            ],
            "actions": [
                {"name": "reset"}
            ],
            "formats": []
        });
        let model: DeviceModel = serde_json::from_value(json).unwrap();
        assert_eq!(model.urn.as_str(), "urn:sensorlink:device:meter");
        assert_eq!(model.attributes.len(), 1);
        assert!(model.action("reset").is_some());
        assert!(model.action("reset").unwrap().argument_type.is_none());
    }
}
