//! # Policy Engine
//!
//! Server-authored device policies and their lifecycle on the client:
//! - Policy documents parsed from the fetched JSON descriptor
//! - The {device -> model -> policy} association graph with lazy fetch
//! - The live change protocol (`changed`/`assigned`/`unassigned`)
//! - Local persistence as an authoritative cache
//! - Change listeners for the pipeline runtime

pub mod document;
pub mod error;
pub mod manager;
pub mod resource;
pub mod rest;
pub mod store;

pub use document::{DevicePolicy, PolicyFunction, ALL_ATTRIBUTES};
pub use error::{PolicyError, Result};
pub use manager::{
    ChangeListener, ChangeOp, ListenerId, PolicyChangeItem, PolicyManager, PolicyManagerConfig,
};
pub use resource::PolicyResource;
pub use rest::RestPolicyResource;
pub use store::PolicyStore;
