//! Batching operators: `batchBySize`, `batchByTime`, `batchByCost`
//!
//! All three share a FIFO queue per pipeline slot. `batchBySize` releases
//! on count, `batchByTime` only when the scheduled slide fires, and
//! `batchByCost` when the current network cost drops to or below the
//! configured threshold. Attribute-value batches can spill to an optional
//! [`BatchPersistence`] collaborator keyed by endpoint id.

use std::collections::VecDeque;

use sensorlink_core::{AttributeValue, DeviceId, NetworkCost};
use tracing::warn;

use crate::context::FunctionContext;
use crate::params::Parameters;
use crate::value::FnValue;

/// Optional spill store for in-flight attribute batches
///
/// The collaborator owns durability; the engine treats it as best-effort
/// and keeps the in-memory queue authoritative.
pub trait BatchPersistence: Send + Sync {
    /// Replace the persisted batch for this endpoint
    fn save(&self, endpoint: &DeviceId, batch: &[AttributeValue]);

    /// Drop the persisted batch for this endpoint
    fn clear(&self, endpoint: &DeviceId);
}

/// Queue state shared by the three batch operators
#[derive(Debug, Clone, Default)]
pub struct BatchState {
    pub queue: VecDeque<FnValue>,
}

impl BatchState {
    fn push(&mut self, ctx: &FunctionContext<'_>, value: FnValue) {
        self.queue.push_back(value);
        self.spill(ctx);
    }

    fn drain(&mut self, ctx: &FunctionContext<'_>) -> Option<FnValue> {
        if self.queue.is_empty() {
            return None;
        }
        let items: Vec<FnValue> = self.queue.drain(..).collect();
        if let Some(store) = ctx.batch_store {
            store.clear(ctx.device_id);
        }
        Some(FnValue::List(items))
    }

    fn spill(&self, ctx: &FunctionContext<'_>) {
        let Some(store) = ctx.batch_store else {
            return;
        };
        // Only pure attribute batches spill; message batches stay in memory.
        let attributes: Vec<AttributeValue> = self
            .queue
            .iter()
            .filter_map(|v| v.as_attribute().cloned())
            .collect();
        if attributes.len() == self.queue.len() {
            store.save(ctx.device_id, &attributes);
        }
    }
}

pub(crate) fn by_size_apply(
    ctx: &FunctionContext<'_>,
    params: Parameters<'_>,
    state: &mut BatchState,
    value: FnValue,
) -> bool {
    let batch_size = match params.i64("batchSize") {
        Some(n) if n > 0 => n as usize,
        _ => {
            warn!("batchBySize missing a positive batchSize; passing values through");
            1
        }
    };
    state.push(ctx, value);
    state.queue.len() >= batch_size
}

pub(crate) fn by_time_apply(
    ctx: &FunctionContext<'_>,
    state: &mut BatchState,
    value: FnValue,
) -> bool {
    state.push(ctx, value);
    // Emission is driven entirely by the scheduled slide
    false
}

pub(crate) fn by_cost_apply(
    ctx: &FunctionContext<'_>,
    params: Parameters<'_>,
    state: &mut BatchState,
    value: FnValue,
) -> bool {
    let configured = params
        .str("networkCost")
        .map(NetworkCost::parse_lenient)
        .unwrap_or_default();
    state.push(ctx, value);
    configured >= ctx.network.current()
}

pub(crate) fn get(ctx: &FunctionContext<'_>, state: &mut BatchState) -> Option<FnValue> {
    state.drain(ctx)
}
