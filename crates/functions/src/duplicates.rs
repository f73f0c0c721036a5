//! Duplicate handling operators: `eliminateDuplicates`, `detectDuplicates`
//!
//! Both track the last seen value and a window end. `eliminateDuplicates`
//! filters repeats inside the window; `detectDuplicates` never filters but
//! raises at most one alert per window when a repeat is observed.

use sensorlink_core::{DataItem, Severity};
use tracing::debug;

use crate::context::{AlertRequest, FunctionContext};
use crate::params::Parameters;
use crate::state::attribute_values_equal;
use crate::value::FnValue;

/// Alert format URN raised by `detectDuplicates`
pub const DUPLICATE_ALERT_URN: &str = "urn:sensorlink:alert:duplicate";

/// Shared state for both duplicate operators
#[derive(Debug, Clone, Default)]
pub struct DuplicateState {
    pub last_value: Option<FnValue>,
    pub window_end_ms: i64,
    /// Whether an alert was already raised in the current window
    pub alerted: bool,
    /// Repeats observed in the current window
    pub repeats: u64,
}

pub(crate) fn eliminate_apply(
    ctx: &FunctionContext<'_>,
    params: Parameters<'_>,
    state: &mut DuplicateState,
    value: FnValue,
) -> bool {
    let window_ms = params.i64("window").unwrap_or(0).max(0);

    let is_repeat = state
        .last_value
        .as_ref()
        .is_some_and(|last| attribute_values_equal(last, &value));

    if is_repeat && ctx.now_ms <= state.window_end_ms {
        debug!("Duplicate value suppressed");
        return false;
    }

    state.last_value = Some(value);
    state.window_end_ms = ctx.now_ms + window_ms;
    true
}

pub(crate) fn detect_apply(
    ctx: &mut FunctionContext<'_>,
    attribute: &str,
    params: Parameters<'_>,
    state: &mut DuplicateState,
    value: FnValue,
) -> bool {
    let window_ms = params.i64("window").unwrap_or(0).max(0);

    let is_repeat = state
        .last_value
        .as_ref()
        .is_some_and(|last| attribute_values_equal(last, &value));

    if is_repeat && ctx.now_ms <= state.window_end_ms {
        state.repeats += 1;
        if !state.alerted {
            state.alerted = true;
            let mut fields = vec![
                DataItem::new(
                    "attribute",
                    sensorlink_core::AttributeValue::String(attribute.to_string()),
                ),
                DataItem::new(
                    "count",
                    sensorlink_core::AttributeValue::Integer(state.repeats as i64),
                ),
            ];
            if let FnValue::Attribute(av) = &value {
                fields.push(DataItem::new("value", av.clone()));
            }
            ctx.alerts.push(AlertRequest {
                format_urn: DUPLICATE_ALERT_URN.to_string(),
                severity: Severity::Normal,
                fields,
                description: Some(format!("Duplicate value reported for '{}'", attribute)),
            });
        }
    } else {
        state.window_end_ms = ctx.now_ms + window_ms;
        state.alerted = false;
        state.repeats = 0;
    }

    state.last_value = Some(value);
    // detectDuplicates observes; it never filters
    true
}

pub(crate) fn get(state: &mut DuplicateState) -> Option<FnValue> {
    state.last_value.clone()
}
