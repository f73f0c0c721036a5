//! # SensorLink Device Function Library
//!
//! The catalog of stream operators a policy pipeline is built from. Every
//! operator implements the same two-method contract on [`DeviceFunction`]:
//!
//! - `apply(ctx, attr, params, state, value) -> bool`: feed one value;
//!   `true` means the next operator may run now (a value is ready)
//! - `get(ctx, attr, params, state) -> Option<FnValue>`: retrieve the
//!   ready value, possibly clearing it from the slot state
//!
//! Operator state lives in the [`FunctionState`] sum type, one variant per
//! operator family, owned by the pipeline slot. A pipeline stops at the
//! first `apply -> false` unless a scheduled slide fires or an alert
//! severity overrides a downstream batcher (both driven by the runtime).

pub mod aggregation;
pub mod batch;
pub mod condition;
pub mod context;
pub mod duplicates;
pub mod library;
pub mod params;
pub mod privacy;
pub mod sample;
pub mod state;
pub mod value;

pub use batch::BatchPersistence;
pub use context::{ActionRequest, AlertRequest, FunctionContext};
pub use library::DeviceFunction;
pub use params::Parameters;
pub use state::FunctionState;
pub use value::FnValue;
