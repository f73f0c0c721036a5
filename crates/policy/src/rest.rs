//! REST implementation of the policy resource
//!
//! Endpoint shapes, with `fields` trimmed to what the engine consumes:
//!
//! ```text
//! GET /deviceModels/{urn}/devicePolicies/{id}?fields=id,pipelines,enabled,lastModified
//! GET /deviceModels/{urn}/devicePolicies?q={"devices.id":"{dev}"}&fields=id,pipelines,enabled,lastModified
//! GET /deviceModels/{urn}/devicePolicies/{id}/devices?q={"directlyConnectedOwner":"{gw}"}&fields=id
//! ```
//!
//! List responses arrive as `{"items": [...]}`.

use crate::document::DevicePolicy;
use crate::error::{PolicyError, Result};
use crate::resource::PolicyResource;
use async_trait::async_trait;
use sensorlink_core::{DeviceId, ModelUrn};
use serde_json::Value;
use tracing::debug;

const POLICY_FIELDS: &str = "id,pipelines,enabled,lastModified";

/// HTTPS-backed policy resource
///
/// Authentication (headers, client certificates) is the transport
/// collaborator's concern; callers hand in a preconfigured client.
pub struct RestPolicyResource {
    client: reqwest::Client,
    base_url: String,
}

impl RestPolicyResource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| PolicyError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PolicyError::Network(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PolicyError::Network(e.to_string()))
    }
}

#[async_trait]
impl PolicyResource for RestPolicyResource {
    async fn get_policy(
        &self,
        model_urn: &ModelUrn,
        policy_id: &str,
    ) -> Result<Option<DevicePolicy>> {
        let path = format!("/deviceModels/{}/devicePolicies/{}", model_urn, policy_id);
        let body = match self.get_json(&path, &[("fields", POLICY_FIELDS)]).await {
            Ok(body) => body,
            Err(PolicyError::Network(message)) if message.contains("404") => return Ok(None),
            Err(e) => return Err(e),
        };
        let policy = DevicePolicy::from_descriptor(model_urn.clone(), &body)?;
        Ok(Some(policy))
    }

    async fn find_policy_for_device(
        &self,
        model_urn: &ModelUrn,
        device_id: &DeviceId,
    ) -> Result<Option<DevicePolicy>> {
        let path = format!("/deviceModels/{}/devicePolicies", model_urn);
        let q = format!("{{\"devices.id\":\"{}\"}}", device_id);
        let body = self
            .get_json(&path, &[("q", q.as_str()), ("fields", POLICY_FIELDS)])
            .await?;

        let Some(first) = body.get("items").and_then(Value::as_array).and_then(|items| items.first())
        else {
            return Ok(None);
        };
        let policy = DevicePolicy::from_descriptor(model_urn.clone(), first)?;
        Ok(Some(policy))
    }

    async fn policy_devices(
        &self,
        model_urn: &ModelUrn,
        policy_id: &str,
        gateway: &DeviceId,
    ) -> Result<Vec<DeviceId>> {
        let path = format!(
            "/deviceModels/{}/devicePolicies/{}/devices",
            model_urn, policy_id
        );
        let q = format!("{{\"directlyConnectedOwner\":\"{}\"}}", gateway);
        let body = self
            .get_json(&path, &[("q", q.as_str()), ("fields", "id")])
            .await?;

        let devices = body
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("id").and_then(Value::as_str))
                    .filter_map(|id| DeviceId::new(id).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let resource =
            RestPolicyResource::new(reqwest::Client::new(), "https://iot.example.test/api/v2///");
        assert_eq!(resource.base_url, "https://iot.example.test/api/v2");
    }
}
