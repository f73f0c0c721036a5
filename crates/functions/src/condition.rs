//! Condition-driven operators: `filterCondition`, `computedMetric`,
//! `alertCondition`, `actionCondition`
//!
//! All four evaluate a server-authored formula against the analog's value
//! provider. The condition formula is parsed once per assignment and
//! cached in the slot state; alert-field and action-argument formulas are
//! parsed when the condition fires.

use sensorlink_core::{AttributeType, AttributeValue, DataItem, Severity};
use sensorlink_formula::{condition_holds, parse, Expr};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::{ActionRequest, AlertRequest, FunctionContext};
use crate::params::Parameters;
use crate::state::ValueState;
use crate::value::FnValue;

/// Parse-and-cache for the slot's condition formula
fn cached_condition<'s>(state: &'s mut ValueState, source: &str) -> Option<&'s Expr> {
    if state.formula.is_none() {
        match parse(source) {
            Ok(expr) => state.formula = Some(expr),
            Err(e) => {
                warn!("Unparseable condition '{}': {}", source, e);
                return None;
            }
        }
    }
    state.formula.as_ref()
}

fn condition_fires(
    ctx: &FunctionContext<'_>,
    params: Parameters<'_>,
    state: &mut ValueState,
) -> bool {
    let Some(source) = params.str("condition") else {
        return false;
    };
    let Some(expr) = cached_condition(state, source) else {
        return false;
    };
    condition_holds(expr.evaluate(ctx.values))
}

pub(crate) fn filter_apply(
    ctx: &FunctionContext<'_>,
    params: Parameters<'_>,
    state: &mut ValueState,
    value: FnValue,
) -> bool {
    state.value = Some(value);
    // The value passes when the condition does NOT hold
    !condition_fires(ctx, params, state)
}

pub(crate) fn computed_metric_apply(
    ctx: &FunctionContext<'_>,
    params: Parameters<'_>,
    state: &mut ValueState,
    _value: FnValue,
) -> bool {
    let Some(source) = params.str("formula") else {
        warn!("computedMetric without a formula; dropping");
        return false;
    };
    let Some(expr) = cached_condition(state, source) else {
        return false;
    };
    let result = expr.evaluate(ctx.values);
    if result.is_finite() {
        state.value = Some(FnValue::Attribute(AttributeValue::Number(result)));
        true
    } else {
        debug!("computedMetric produced non-finite result; dropping");
        false
    }
}

pub(crate) fn alert_apply(
    ctx: &mut FunctionContext<'_>,
    params: Parameters<'_>,
    state: &mut ValueState,
    value: FnValue,
) -> bool {
    state.value = Some(value);
    if !condition_fires(ctx, params, state) {
        return true;
    }

    raise_alert(ctx, params);

    // filter defaults to true: a firing alert consumes the value
    !params.bool("filter").unwrap_or(true)
}

fn raise_alert(ctx: &mut FunctionContext<'_>, params: Parameters<'_>) {
    let Some(urn) = params.str("urn") else {
        warn!("alertCondition fired without an alert urn; skipping");
        return;
    };

    let severity = params
        .str("severity")
        .and_then(|s| s.parse::<Severity>().ok())
        .unwrap_or_default();

    let mut fields = Vec::new();
    if let Some(Value::Object(field_map)) = params.get("fields") {
        let format = ctx.model.format(urn);
        for (name, formula_value) in field_map {
            let Some(source) = formula_value.as_str() else {
                warn!("Alert field '{}' is not a formula string; skipping", name);
                continue;
            };
            let result = match parse(source) {
                Ok(expr) => expr.evaluate(ctx.values),
                Err(e) => {
                    warn!("Unparseable alert field formula '{}': {}", source, e);
                    continue;
                }
            };
            if result.is_nan() {
                warn!("Alert field '{}' evaluated to NaN; skipping", name);
                continue;
            }
            let declared = format
                .and_then(|f| f.fields.iter().find(|field| field.name == *name))
                .map(|field| field.field_type)
                .unwrap_or(AttributeType::Number);
            let Some(coerced) = AttributeValue::Number(result).cast(declared) else {
                warn!("Alert field '{}' cannot coerce to {}; skipping", name, declared);
                continue;
            };
            fields.push(DataItem::new(name.clone(), coerced));
        }
    }

    ctx.alerts.push(AlertRequest {
        format_urn: urn.to_string(),
        severity,
        fields,
        description: params.str("description").map(str::to_string),
    });
}

pub(crate) fn action_apply(
    ctx: &mut FunctionContext<'_>,
    params: Parameters<'_>,
    state: &mut ValueState,
    value: FnValue,
) -> bool {
    state.value = Some(value);
    if !condition_fires(ctx, params, state) {
        return true;
    }

    invoke_action(ctx, params);

    !params.bool("filter").unwrap_or(true)
}

fn invoke_action(ctx: &mut FunctionContext<'_>, params: Parameters<'_>) {
    let Some(name) = params.str("name") else {
        warn!("actionCondition fired without an action name; skipping");
        return;
    };
    let Some(action) = ctx.model.action(name) else {
        warn!(
            "Model {} declares no action '{}'; skipping invocation",
            ctx.model.urn, name
        );
        return;
    };

    let formulas: Vec<&str> = params
        .get("arguments")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let argument = match (action.argument_type, formulas.first()) {
        (None, _) => None,
        (Some(declared), Some(source)) => {
            let result = match parse(source) {
                Ok(expr) => expr.evaluate(ctx.values),
                Err(e) => {
                    warn!("Unparseable action argument '{}': {}", source, e);
                    return;
                }
            };
            if result.is_nan() {
                warn!("Action '{}' argument evaluated to NaN; skipping", name);
                return;
            }
            let bounded = clamp_to_bounds(result, action.lower_bound, action.upper_bound, name);
            match AttributeValue::Number(bounded).cast(declared) {
                Some(value) => Some(value),
                None => {
                    warn!("Action '{}' argument cannot coerce to {}; skipping", name, declared);
                    return;
                }
            }
        }
        (Some(_), None) => {
            warn!("Action '{}' requires an argument but none was supplied; skipping", name);
            return;
        }
    };

    if formulas.len() > 1 {
        warn!("Action '{}' given {} arguments; only the first is used", name, formulas.len());
    }

    ctx.actions.push(ActionRequest {
        name: name.to_string(),
        argument,
    });
}

fn clamp_to_bounds(value: f64, lower: Option<f64>, upper: Option<f64>, action: &str) -> f64 {
    let mut bounded = value;
    if let Some(lower) = lower {
        if bounded < lower {
            warn!("Action '{}' argument {} below lower bound {}; clamping", action, bounded, lower);
            bounded = lower;
        }
    }
    if let Some(upper) = upper {
        if bounded > upper {
            warn!("Action '{}' argument {} above upper bound {}; clamping", action, bounded, upper);
            bounded = upper;
        }
    }
    bounded
}

pub(crate) fn get(state: &mut ValueState) -> Option<FnValue> {
    state.value.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorlink_core::model::{FormatField, FormatType, ModelFormat};
    use sensorlink_core::{DeviceId, DeviceModel, ModelAction, ModelUrn, NetworkMonitor};
    use sensorlink_formula::ValueProvider;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapProvider(HashMap<String, f64>);

    impl ValueProvider for MapProvider {
        fn in_process(&self, attribute: &str) -> Option<f64> {
            self.0.get(attribute).copied()
        }
        fn current(&self, attribute: &str) -> Option<f64> {
            self.0.get(attribute).copied()
        }
    }

    struct Harness {
        device: DeviceId,
        model: DeviceModel,
        network: NetworkMonitor,
        values: MapProvider,
        alerts: Vec<AlertRequest>,
        actions: Vec<ActionRequest>,
    }

    impl Harness {
        fn new(values: &[(&str, f64)]) -> Self {
            Self {
                device: DeviceId::new("dev-cond").unwrap(),
                model: DeviceModel {
                    urn: ModelUrn::new("urn:test:model").unwrap(),
                    name: None,
                    description: None,
                    attributes: vec![],
                    actions: vec![ModelAction {
                        name: "setPoint".to_string(),
                        argument_type: Some(AttributeType::Integer),
                        lower_bound: Some(0.0),
                        upper_bound: Some(100.0),
                    }],
                    formats: vec![ModelFormat {
                        urn: "urn:test:model:tooHot".to_string(),
                        name: "tooHot".to_string(),
                        format_type: FormatType::Alert,
                        fields: vec![FormatField {
                            name: "temp".to_string(),
                            field_type: AttributeType::Integer,
                            optional: false,
                        }],
                    }],
                },
                network: NetworkMonitor::default(),
                values: MapProvider(values.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
                alerts: Vec::new(),
                actions: Vec::new(),
            }
        }

        fn ctx(&mut self) -> FunctionContext<'_> {
            FunctionContext {
                now_ms: 0,
                device_id: &self.device,
                model: &self.model,
                values: &self.values,
                network: &self.network,
                batch_store: None,
                alerts: &mut self.alerts,
                actions: &mut self.actions,
            }
        }
    }

    fn num(v: f64) -> FnValue {
        FnValue::Attribute(AttributeValue::Number(v))
    }

    #[test]
    fn test_filter_passes_when_condition_false() {
        let mut harness = Harness::new(&[("x", 5.0)]);
        let map = json!({"condition": "$(x) > 100"});
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let ctx = harness.ctx();
        assert!(filter_apply(&ctx, Parameters::new(map), &mut state, num(5.0)));
    }

    #[test]
    fn test_filter_drops_when_condition_true() {
        let mut harness = Harness::new(&[("x", 500.0)]);
        let map = json!({"condition": "$(x) > 100"});
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let ctx = harness.ctx();
        assert!(!filter_apply(&ctx, Parameters::new(map), &mut state, num(500.0)));
        // The stored value is still retrievable by get
        assert!(get(&mut state).is_some());
    }

    #[test]
    fn test_filter_tolerance_boundary() {
        // Condition result exactly 1.0 holds, so the value is dropped
        let mut harness = Harness::new(&[]);
        let map = json!({"condition": "1.0"});
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();
        let ctx = harness.ctx();
        assert!(!filter_apply(&ctx, Parameters::new(map), &mut state, num(1.0)));

        // 0.999 is inside the open interval: condition false, value passes
        let map = json!({"condition": "0.999"});
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();
        let ctx = harness.ctx();
        assert!(filter_apply(&ctx, Parameters::new(map), &mut state, num(1.0)));
    }

    #[test]
    fn test_filter_without_condition_passes() {
        let mut harness = Harness::new(&[]);
        let map = json!({});
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();
        let ctx = harness.ctx();
        assert!(filter_apply(&ctx, Parameters::new(map), &mut state, num(1.0)));
    }

    #[test]
    fn test_computed_metric_stores_result() {
        let mut harness = Harness::new(&[("a", 1.0), ("b", 2.0)]);
        let map = json!({"formula": "$(a) + $(b)"});
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let ctx = harness.ctx();
        assert!(computed_metric_apply(&ctx, Parameters::new(map), &mut state, num(0.0)));
        match get(&mut state) {
            Some(FnValue::Attribute(AttributeValue::Number(v))) => assert_eq!(v, 3.0),
            other => panic!("Expected computed number, got {:?}", other),
        }
    }

    #[test]
    fn test_computed_metric_non_finite_drops() {
        let mut harness = Harness::new(&[]);
        let map = json!({"formula": "$(missing) + 1"});
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let ctx = harness.ctx();
        assert!(!computed_metric_apply(&ctx, Parameters::new(map), &mut state, num(0.0)));
    }

    #[test]
    fn test_alert_fires_with_coerced_fields() {
        let mut harness = Harness::new(&[("temperature", 98.6)]);
        let map = json!({
            "condition": "$(temperature) > 90",
            "urn": "urn:test:model:tooHot",
            "fields": {"temp": "$(temperature)"},
            "severity": "CRITICAL"
        });
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let mut ctx = harness.ctx();
        // Default filter=true consumes the value
        assert!(!alert_apply(&mut ctx, Parameters::new(map), &mut state, num(98.6)));

        assert_eq!(harness.alerts.len(), 1);
        let alert = &harness.alerts[0];
        assert_eq!(alert.format_urn, "urn:test:model:tooHot");
        assert_eq!(alert.severity, Severity::Critical);
        // Declared INTEGER field coerces the evaluated number
        assert_eq!(alert.fields[0].value, AttributeValue::Integer(98));
    }

    #[test]
    fn test_alert_filter_false_passes_value_through() {
        let mut harness = Harness::new(&[("temperature", 98.6)]);
        let map = json!({
            "condition": "$(temperature) > 90",
            "urn": "urn:test:model:tooHot",
            "filter": false
        });
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let mut ctx = harness.ctx();
        assert!(alert_apply(&mut ctx, Parameters::new(map), &mut state, num(98.6)));
        assert_eq!(harness.alerts.len(), 1);
    }

    #[test]
    fn test_alert_quiet_when_condition_false() {
        let mut harness = Harness::new(&[("temperature", 20.0)]);
        let map = json!({
            "condition": "$(temperature) > 90",
            "urn": "urn:test:model:tooHot"
        });
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let mut ctx = harness.ctx();
        assert!(alert_apply(&mut ctx, Parameters::new(map), &mut state, num(20.0)));
        assert!(harness.alerts.is_empty());
    }

    #[test]
    fn test_action_invoked_with_clamped_argument() {
        let mut harness = Harness::new(&[("x", 250.0)]);
        let map = json!({
            "condition": "$(x) > 100",
            "name": "setPoint",
            "arguments": ["$(x)"]
        });
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let mut ctx = harness.ctx();
        assert!(!action_apply(&mut ctx, Parameters::new(map), &mut state, num(250.0)));

        assert_eq!(harness.actions.len(), 1);
        let action = &harness.actions[0];
        assert_eq!(action.name, "setPoint");
        // 250 clamps to the model's upper bound 100, coerced to INTEGER
        assert_eq!(action.argument, Some(AttributeValue::Integer(100)));
    }

    #[test]
    fn test_action_missing_required_argument_skipped() {
        let mut harness = Harness::new(&[("x", 250.0)]);
        let map = json!({
            "condition": "$(x) > 100",
            "name": "setPoint"
        });
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let mut ctx = harness.ctx();
        action_apply(&mut ctx, Parameters::new(map), &mut state, num(250.0));
        assert!(harness.actions.is_empty());
    }

    #[test]
    fn test_action_unknown_name_skipped() {
        let mut harness = Harness::new(&[("x", 250.0)]);
        let map = json!({
            "condition": "$(x) > 100",
            "name": "selfDestruct",
            "arguments": ["1"]
        });
        let map = map.as_object().unwrap();
        let mut state = ValueState::default();

        let mut ctx = harness.ctx();
        action_apply(&mut ctx, Parameters::new(map), &mut state, num(250.0));
        assert!(harness.actions.is_empty());
    }
}
