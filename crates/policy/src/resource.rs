//! Remote policy resource abstraction
//!
//! The enterprise server owns policy documents; the engine fetches them
//! lazily and on change notifications. Implementations must bound their
//! response time; the manager treats any error as transient and
//! re-bootstraps lazily.

use crate::document::DevicePolicy;
use crate::error::Result;
use async_trait::async_trait;
use sensorlink_core::{DeviceId, ModelUrn};

/// Server-side policy lookups consumed by the policy manager
#[async_trait]
pub trait PolicyResource: Send + Sync {
    /// Fetch one policy document by id
    async fn get_policy(
        &self,
        model_urn: &ModelUrn,
        policy_id: &str,
    ) -> Result<Option<DevicePolicy>>;

    /// Find the policy currently assigned to a device for a model
    async fn find_policy_for_device(
        &self,
        model_urn: &ModelUrn,
        device_id: &DeviceId,
    ) -> Result<Option<DevicePolicy>>;

    /// List the devices assigned to a policy that are owned by the given
    /// gateway (indirectly-connected device enumeration)
    async fn policy_devices(
        &self,
        model_urn: &ModelUrn,
        policy_id: &str,
        gateway: &DeviceId,
    ) -> Result<Vec<DeviceId>>;
}
