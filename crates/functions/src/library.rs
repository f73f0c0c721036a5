//! Operator catalog and dispatch
//!
//! `DeviceFunction` names the operators a policy pipeline may reference.
//! Unknown ids are rejected at policy-parse time; dispatch here assumes a
//! known id and routes to the operator modules.

use tracing::warn;

use crate::aggregation::{self, AggregationKind, AggregationState};
use crate::batch;
use crate::condition;
use crate::context::FunctionContext;
use crate::duplicates;
use crate::params::Parameters;
use crate::privacy;
use crate::sample;
use crate::state::{FunctionState, SampleState, ValueState};
use crate::value::FnValue;

/// One of the fourteen policy stream operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFunction {
    FilterCondition,
    SampleQuality,
    Mean,
    Min,
    Max,
    StandardDeviation,
    EliminateDuplicates,
    DetectDuplicates,
    BatchBySize,
    BatchByTime,
    BatchByCost,
    PrivacyPolicy,
    AlertCondition,
    ComputedMetric,
    ActionCondition,
}

impl DeviceFunction {
    /// Resolve a policy function id
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "filterCondition" => Some(Self::FilterCondition),
            "sampleQuality" => Some(Self::SampleQuality),
            "mean" => Some(Self::Mean),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "standardDeviation" => Some(Self::StandardDeviation),
            "eliminateDuplicates" => Some(Self::EliminateDuplicates),
            "detectDuplicates" => Some(Self::DetectDuplicates),
            "batchBySize" => Some(Self::BatchBySize),
            "batchByTime" => Some(Self::BatchByTime),
            "batchByCost" => Some(Self::BatchByCost),
            "privacyPolicy" => Some(Self::PrivacyPolicy),
            "alertCondition" => Some(Self::AlertCondition),
            "computedMetric" => Some(Self::ComputedMetric),
            "actionCondition" => Some(Self::ActionCondition),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Self::FilterCondition => "filterCondition",
            Self::SampleQuality => "sampleQuality",
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
            Self::StandardDeviation => "standardDeviation",
            Self::EliminateDuplicates => "eliminateDuplicates",
            Self::DetectDuplicates => "detectDuplicates",
            Self::BatchBySize => "batchBySize",
            Self::BatchByTime => "batchByTime",
            Self::BatchByCost => "batchByCost",
            Self::PrivacyPolicy => "privacyPolicy",
            Self::AlertCondition => "alertCondition",
            Self::ComputedMetric => "computedMetric",
            Self::ActionCondition => "actionCondition",
        }
    }

    /// Fresh state of the shape this operator expects
    pub fn initial_state(&self) -> FunctionState {
        match self {
            Self::FilterCondition
            | Self::PrivacyPolicy
            | Self::AlertCondition
            | Self::ComputedMetric
            | Self::ActionCondition => FunctionState::Value(ValueState::default()),
            Self::SampleQuality => FunctionState::Sample(SampleState::default()),
            Self::Mean | Self::Min | Self::Max | Self::StandardDeviation => {
                FunctionState::Aggregation(AggregationState::default())
            }
            Self::EliminateDuplicates | Self::DetectDuplicates => {
                FunctionState::Duplicates(Default::default())
            }
            Self::BatchBySize | Self::BatchByTime | Self::BatchByCost => {
                FunctionState::Batch(Default::default())
            }
        }
    }

    /// The `(window, slide)` in milliseconds for operators driven by the
    /// scheduled-slide driver; `None` for operators without a schedule.
    ///
    /// The duplicate operators manage their window inside `apply` and are
    /// deliberately absent here.
    pub fn window_spec(&self, params: Parameters<'_>) -> Option<(i64, i64)> {
        match self {
            Self::Mean | Self::Min | Self::Max | Self::StandardDeviation => {
                let window = params.window_ms()?;
                Some((window, params.slide_ms(window)))
            }
            Self::BatchByTime => {
                let delay = params.i64("delayLimit").filter(|d| *d > 0)?;
                Some((delay, delay))
            }
            _ => None,
        }
    }

    /// Feed one value into this operator
    ///
    /// Returns `true` iff the next operator may run now.
    pub fn apply(
        &self,
        ctx: &mut FunctionContext<'_>,
        attribute: &str,
        params: Parameters<'_>,
        state: &mut FunctionState,
        value: FnValue,
    ) -> bool {
        match self {
            Self::FilterCondition => condition::filter_apply(ctx, params, state.value_mut(), value),
            Self::SampleQuality => sample::apply(params, state.sample_mut(), value),
            Self::Mean => aggregate_apply(AggregationKind::Mean, ctx, attribute, params, state, value),
            Self::Min => aggregate_apply(AggregationKind::Min, ctx, attribute, params, state, value),
            Self::Max => aggregate_apply(AggregationKind::Max, ctx, attribute, params, state, value),
            Self::StandardDeviation => aggregate_apply(
                AggregationKind::StandardDeviation,
                ctx,
                attribute,
                params,
                state,
                value,
            ),
            Self::EliminateDuplicates => {
                duplicates::eliminate_apply(ctx, params, state.duplicates_mut(), value)
            }
            Self::DetectDuplicates => {
                duplicates::detect_apply(ctx, attribute, params, state.duplicates_mut(), value)
            }
            Self::BatchBySize => batch::by_size_apply(ctx, params, state.batch_mut(), value),
            Self::BatchByTime => batch::by_time_apply(ctx, state.batch_mut(), value),
            Self::BatchByCost => batch::by_cost_apply(ctx, params, state.batch_mut(), value),
            Self::PrivacyPolicy => {
                let redacted = privacy::redact(params, value);
                state.value_mut().value = Some(redacted);
                true
            }
            Self::AlertCondition => condition::alert_apply(ctx, params, state.value_mut(), value),
            Self::ComputedMetric => {
                condition::computed_metric_apply(ctx, params, state.value_mut(), value)
            }
            Self::ActionCondition => condition::action_apply(ctx, params, state.value_mut(), value),
        }
    }

    /// Retrieve the ready value, clearing it from the state where the
    /// operator's contract says so (batch drains, window slides).
    pub fn get(
        &self,
        ctx: &mut FunctionContext<'_>,
        _attribute: &str,
        _params: Parameters<'_>,
        state: &mut FunctionState,
    ) -> Option<FnValue> {
        match self {
            Self::FilterCondition
            | Self::PrivacyPolicy
            | Self::AlertCondition
            | Self::ComputedMetric
            | Self::ActionCondition => condition::get(state.value_mut()),
            Self::SampleQuality => sample::get(state.sample_mut()),
            Self::Mean | Self::Min | Self::Max | Self::StandardDeviation => {
                aggregation::get(state.aggregation_mut())
                    .map(|v| FnValue::Attribute(sensorlink_core::AttributeValue::Number(v)))
            }
            Self::EliminateDuplicates | Self::DetectDuplicates => {
                duplicates::get(state.duplicates_mut())
            }
            Self::BatchBySize | Self::BatchByTime | Self::BatchByCost => {
                batch::get(ctx, state.batch_mut())
            }
        }
    }

    /// Whether this operator batches whole messages in the
    /// all-attributes pipeline (severity override applies to it)
    pub fn is_batcher(&self) -> bool {
        matches!(self, Self::BatchBySize | Self::BatchByTime | Self::BatchByCost)
    }
}

fn aggregate_apply(
    kind: AggregationKind,
    ctx: &FunctionContext<'_>,
    attribute: &str,
    params: Parameters<'_>,
    state: &mut FunctionState,
    value: FnValue,
) -> bool {
    let Some(attribute_value) = value.as_attribute() else {
        warn!("Aggregation on '{}' received a non-attribute value; dropping", attribute);
        return false;
    };
    let Some(numeric) = attribute_value.as_f64() else {
        warn!(
            "Aggregation on '{}' requires a numeric value, got {}; dropping",
            attribute,
            attribute_value.attribute_type()
        );
        return false;
    };
    aggregation::apply(kind, ctx, attribute, params, state.aggregation_mut(), numeric)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_round_trip() {
        let all = [
            DeviceFunction::FilterCondition,
            DeviceFunction::SampleQuality,
            DeviceFunction::Mean,
            DeviceFunction::Min,
            DeviceFunction::Max,
            DeviceFunction::StandardDeviation,
            DeviceFunction::EliminateDuplicates,
            DeviceFunction::DetectDuplicates,
            DeviceFunction::BatchBySize,
            DeviceFunction::BatchByTime,
            DeviceFunction::BatchByCost,
            DeviceFunction::PrivacyPolicy,
            DeviceFunction::AlertCondition,
            DeviceFunction::ComputedMetric,
            DeviceFunction::ActionCondition,
        ];
        for function in all {
            assert_eq!(DeviceFunction::from_id(function.id()), Some(function));
        }
        assert_eq!(DeviceFunction::from_id("teleport"), None);
    }

    #[test]
    fn test_window_spec() {
        let map = serde_json::json!({"window": 10000, "slide": 5000});
        let map = map.as_object().unwrap();
        assert_eq!(
            DeviceFunction::Mean.window_spec(Parameters::new(map)),
            Some((10000, 5000))
        );
        assert_eq!(DeviceFunction::FilterCondition.window_spec(Parameters::new(map)), None);

        let map = serde_json::json!({"delayLimit": 3000});
        let map = map.as_object().unwrap();
        assert_eq!(
            DeviceFunction::BatchByTime.window_spec(Parameters::new(map)),
            Some((3000, 3000))
        );
    }

    #[test]
    fn test_initial_state_shapes() {
        assert!(matches!(
            DeviceFunction::Mean.initial_state(),
            FunctionState::Aggregation(_)
        ));
        assert!(matches!(
            DeviceFunction::BatchBySize.initial_state(),
            FunctionState::Batch(_)
        ));
        assert!(matches!(
            DeviceFunction::FilterCondition.initial_state(),
            FunctionState::Value(_)
        ));
    }
}
