//! Property-based tests for the formula evaluator

use proptest::prelude::*;
use sensorlink_formula::{condition_holds, parse, ValueProvider};
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

fn eval(formula: &str, values: &[(&str, f64)]) -> f64 {
    let provider = MapProvider(values.iter().map(|(k, v)| (k.to_string(), *v)).collect());
    parse(formula).unwrap().evaluate(&provider)
}

// Property: literal arithmetic matches IEEE-754 double arithmetic
proptest! {
    #[test]
    fn prop_addition_matches_f64(a in -1e6f64..1e6, b in -1e6f64..1e6) {
        let result = eval(&format!("{} + {}", a, b), &[]);
        prop_assert_eq!(result, a + b);
    }
}

// Property: a reference evaluates to exactly the provided value
proptest! {
    #[test]
    fn prop_reference_is_transparent(value in -1e6f64..1e6) {
        let result = eval("$(x)", &[("x", value)]);
        prop_assert_eq!(result, value);
    }
}

// Property: comparisons are total on finite inputs and produce 0/1
proptest! {
    #[test]
    fn prop_comparison_is_boolean(a in -1e6f64..1e6, b in -1e6f64..1e6) {
        let lt = eval(&format!("{} < {}", a, b), &[]);
        let ge = eval(&format!("{} >= {}", a, b), &[]);
        prop_assert!(lt == 0.0 || lt == 1.0);
        prop_assert!(ge == 0.0 || ge == 1.0);
        // Exactly one of a<b / a>=b holds
        prop_assert_eq!(lt + ge, 1.0);
    }
}

// Property: the tolerance rule holds for every evaluated literal
proptest! {
    #[test]
    fn prop_tolerance_rule(value in -10.0f64..10.0) {
        let result = eval(&format!("{}", value), &[]);
        prop_assert_eq!(condition_holds(result), value <= -1.0 || value >= 1.0);
    }
}

// Property: parsing never panics on arbitrary printable input
proptest! {
    #[test]
    fn prop_parse_total(input in "[ -~]{0,64}") {
        let _ = parse(&input);
    }
}
