//! File-backed policy store
//!
//! One pretty-JSON file per policy id plus `device-associations.json`
//! holding the two inverted indexes. The store is authoritative on
//! startup; at runtime every write is synchronous best-effort. A failed
//! write logs and the in-memory graph stays authoritative.

use crate::document::DevicePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming the policy store directory
pub const POLICY_STORE_ENV: &str = "device_policy_store";

/// Fallback directory variable shared with the device-model loader
pub const MODEL_STORE_ENV: &str = "device_model_store";

const ASSOCIATIONS_FILE: &str = "device-associations.json";

/// Persisted association indexes
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoredAssociations {
    /// policyId -> device ids bound to it
    #[serde(rename = "devicesByPolicy", default)]
    pub devices_by_policy: BTreeMap<String, Vec<String>>,

    /// modelUrn -> policy ids cached for it
    #[serde(rename = "policiesByModel", default)]
    pub policies_by_model: BTreeMap<String, Vec<String>>,
}

/// Policy persistence rooted at a configured directory
///
/// With no directory configured the store is disabled and every
/// operation is a no-op.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    dir: Option<PathBuf>,
}

impl PolicyStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Resolve the directory from `device_policy_store`, falling back to
    /// `device_model_store`; unset means persistence is disabled.
    pub fn from_env() -> Self {
        let dir = std::env::var(POLICY_STORE_ENV)
            .or_else(|_| std::env::var(MODEL_STORE_ENV))
            .ok()
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self::new(dir)
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    fn policy_path(&self, policy_id: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        if policy_id.is_empty()
            || policy_id == ASSOCIATIONS_FILE
            || policy_id.contains('/')
            || policy_id.contains('\\')
            || policy_id.contains("..")
        {
            warn!("Policy id '{}' is not a usable file name; not persisting", policy_id);
            return None;
        }
        Some(dir.join(policy_id))
    }

    fn ensure_dir(&self) -> Option<&Path> {
        let dir = self.dir.as_deref()?;
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("Could not create policy store {}: {}", dir.display(), e);
            return None;
        }
        Some(dir)
    }

    /// Persist one policy document, best-effort
    pub fn save_policy(&self, policy: &DevicePolicy) {
        if self.ensure_dir().is_none() {
            return;
        }
        let Some(path) = self.policy_path(&policy.id) else {
            return;
        };
        let body = policy.to_descriptor();
        match serde_json::to_string_pretty(&body) {
            Ok(text) => {
                if let Err(e) = fs::write(&path, text) {
                    warn!("Could not persist policy {}: {}", policy.id, e);
                } else {
                    debug!("Persisted policy {} to {}", policy.id, path.display());
                }
            }
            Err(e) => warn!("Could not serialize policy {}: {}", policy.id, e),
        }
    }

    /// Remove one policy document, best-effort
    pub fn remove_policy(&self, policy_id: &str) {
        let Some(path) = self.policy_path(policy_id) else {
            return;
        };
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Could not remove persisted policy {}: {}", policy_id, e);
            }
        }
    }

    /// Load one policy document, if present and readable
    pub fn load_policy(&self, policy_id: &str) -> Option<DevicePolicy> {
        let path = self.policy_path(policy_id)?;
        let text = fs::read_to_string(&path).ok()?;
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Persisted policy {} is not valid JSON: {}", policy_id, e);
                return None;
            }
        };
        match DevicePolicy::from_stored(&value) {
            Ok(policy) => Some(policy),
            Err(e) => {
                warn!("Persisted policy {} did not parse: {}", policy_id, e);
                None
            }
        }
    }

    /// Persist the association indexes, best-effort
    pub fn save_associations(&self, associations: &StoredAssociations) {
        let Some(dir) = self.ensure_dir() else {
            return;
        };
        let path = dir.join(ASSOCIATIONS_FILE);
        match serde_json::to_string_pretty(associations) {
            Ok(text) => {
                if let Err(e) = fs::write(&path, text) {
                    warn!("Could not persist device associations: {}", e);
                }
            }
            Err(e) => warn!("Could not serialize device associations: {}", e),
        }
    }

    /// Load the association indexes from a previous run
    pub fn load_associations(&self) -> Option<StoredAssociations> {
        let dir = self.dir.as_deref()?;
        let path = dir.join(ASSOCIATIONS_FILE);
        let text = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&text) {
            Ok(associations) => Some(associations),
            Err(e) => {
                warn!("Persisted device associations did not parse: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorlink_core::ModelUrn;
    use serde_json::json;

    fn create_test_policy(id: &str) -> DevicePolicy {
        let descriptor = json!({
            "id": id,
            "lastModified": 42,
            "pipelines": [
                {"attributeName": "x", "pipeline": [{"id": "mean", "parameters": {"window": 1000}}]}
            ]
        });
        DevicePolicy::from_descriptor(
            ModelUrn::new("urn:sensorlink:device:test").unwrap(),
            &descriptor,
        )
        .unwrap()
    }

    #[test]
    fn test_disabled_store_is_inert() {
        let store = PolicyStore::disabled();
        assert!(!store.is_enabled());
        store.save_policy(&create_test_policy("p1"));
        assert!(store.load_policy("p1").is_none());
        assert!(store.load_associations().is_none());
    }

    #[test]
    fn test_policy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(Some(dir.path().to_path_buf()));

        let policy = create_test_policy("p1");
        store.save_policy(&policy);

        let loaded = store.load_policy("p1").unwrap();
        assert_eq!(loaded.id, "p1");
        assert_eq!(loaded.last_modified_ms, 42);
        assert_eq!(loaded.model_urn.as_str(), "urn:sensorlink:device:test");
        assert_eq!(loaded.pipeline("x").unwrap().len(), 1);

        store.remove_policy("p1");
        assert!(store.load_policy("p1").is_none());
    }

    #[test]
    fn test_associations_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(Some(dir.path().to_path_buf()));

        let mut associations = StoredAssociations::default();
        associations
            .devices_by_policy
            .insert("p1".to_string(), vec!["dev-a".to_string(), "dev-b".to_string()]);
        associations
            .policies_by_model
            .insert("urn:sensorlink:device:test".to_string(), vec!["p1".to_string()]);

        store.save_associations(&associations);
        let loaded = store.load_associations().unwrap();
        assert_eq!(loaded, associations);
    }

    #[test]
    fn test_hostile_policy_id_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(Some(dir.path().to_path_buf()));

        let mut policy = create_test_policy("ok");
        policy.id = "../escape".to_string();
        store.save_policy(&policy);

        assert!(!dir.path().parent().unwrap().join("escape").exists());
    }

    #[test]
    fn test_corrupt_file_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(Some(dir.path().to_path_buf()));

        std::fs::write(dir.path().join("bad"), "{not json").unwrap();
        assert!(store.load_policy("bad").is_none());
    }
}
