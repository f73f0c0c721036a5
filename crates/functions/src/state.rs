//! Per-slot operator state
//!
//! Each pipeline slot owns one `FunctionState` variant matching its
//! operator family. A mismatched variant is a programming invariant
//! violation; the accessors self-heal by resetting the slot to a fresh
//! state of the expected shape, which drops at most the in-flight value.

use sensorlink_core::AttributeValue;
use tracing::warn;

use crate::aggregation::AggregationState;
use crate::batch::BatchState;
use crate::duplicates::DuplicateState;
use crate::value::FnValue;
use sensorlink_formula::Expr;

/// State for single-value operators (filters, conditions, privacy)
#[derive(Debug, Clone, Default)]
pub struct ValueState {
    /// The value most recently offered to this slot
    pub value: Option<FnValue>,
    /// Parsed condition/metric formula, cached on first use
    pub formula: Option<Expr>,
}

/// State for `sampleQuality`
#[derive(Debug, Clone, Default)]
pub struct SampleState {
    pub calls: u64,
    pub value: Option<FnValue>,
}

/// Sum type over the operator families
#[derive(Debug, Clone)]
pub enum FunctionState {
    Value(ValueState),
    Sample(SampleState),
    Aggregation(AggregationState),
    Duplicates(DuplicateState),
    Batch(BatchState),
}

impl FunctionState {
    pub fn value_mut(&mut self) -> &mut ValueState {
        if !matches!(self, Self::Value(_)) {
            warn!("Pipeline slot held {} state, expected value state; resetting", self.kind());
            *self = Self::Value(ValueState::default());
        }
        match self {
            Self::Value(state) => state,
            _ => unreachable!(),
        }
    }

    pub fn sample_mut(&mut self) -> &mut SampleState {
        if !matches!(self, Self::Sample(_)) {
            warn!("Pipeline slot held {} state, expected sample state; resetting", self.kind());
            *self = Self::Sample(SampleState::default());
        }
        match self {
            Self::Sample(state) => state,
            _ => unreachable!(),
        }
    }

    pub fn aggregation_mut(&mut self) -> &mut AggregationState {
        if !matches!(self, Self::Aggregation(_)) {
            warn!(
                "Pipeline slot held {} state, expected aggregation state; resetting",
                self.kind()
            );
            *self = Self::Aggregation(AggregationState::default());
        }
        match self {
            Self::Aggregation(state) => state,
            _ => unreachable!(),
        }
    }

    pub fn duplicates_mut(&mut self) -> &mut DuplicateState {
        if !matches!(self, Self::Duplicates(_)) {
            warn!(
                "Pipeline slot held {} state, expected duplicate state; resetting",
                self.kind()
            );
            *self = Self::Duplicates(DuplicateState::default());
        }
        match self {
            Self::Duplicates(state) => state,
            _ => unreachable!(),
        }
    }

    pub fn batch_mut(&mut self) -> &mut BatchState {
        if !matches!(self, Self::Batch(_)) {
            warn!("Pipeline slot held {} state, expected batch state; resetting", self.kind());
            *self = Self::Batch(BatchState::default());
        }
        match self {
            Self::Batch(state) => state,
            _ => unreachable!(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Sample(_) => "sample",
            Self::Aggregation(_) => "aggregation",
            Self::Duplicates(_) => "duplicate",
            Self::Batch(_) => "batch",
        }
    }
}

/// Equality check used by the duplicate operators
///
/// Only attribute values compare; messages never count as duplicates.
pub fn attribute_values_equal(a: &FnValue, b: &FnValue) -> bool {
    match (a, b) {
        (FnValue::Attribute(a), FnValue::Attribute(b)) => attribute_equal(a, b),
        _ => false,
    }
}

fn attribute_equal(a: &AttributeValue, b: &AttributeValue) -> bool {
    match (a, b) {
        // Numeric equality crosses the INTEGER/NUMBER divide
        (AttributeValue::Integer(x), AttributeValue::Number(y))
        | (AttributeValue::Number(y), AttributeValue::Integer(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_healing_on_variant_mismatch() {
        let mut state = FunctionState::Value(ValueState::default());
        // Asking for batch state out of a value slot resets the slot
        let batch = state.batch_mut();
        assert!(batch.queue.is_empty());
        assert!(matches!(state, FunctionState::Batch(_)));
    }

    #[test]
    fn test_numeric_equality_crosses_types() {
        let a = FnValue::Attribute(AttributeValue::Integer(5));
        let b = FnValue::Attribute(AttributeValue::Number(5.0));
        assert!(attribute_values_equal(&a, &b));

        let c = FnValue::Attribute(AttributeValue::Number(5.5));
        assert!(!attribute_values_equal(&a, &c));
    }
}
