//! Property-based tests for core value coercion

use proptest::prelude::*;
use sensorlink_core::{AttributeType, AttributeValue};

// Property: widening an integer to NUMBER and narrowing back is lossless
proptest! {
    #[test]
    fn prop_integer_number_round_trip(value in -1_000_000_000i64..1_000_000_000) {
        let widened = AttributeValue::Integer(value)
            .cast(AttributeType::Number)
            .unwrap();
        let narrowed = widened.cast(AttributeType::Integer).unwrap();
        prop_assert_eq!(narrowed, AttributeValue::Integer(value));
    }
}

// Property: casting to a value's own type is the identity
proptest! {
    #[test]
    fn prop_cast_to_own_type_is_identity(value in -1e9f64..1e9) {
        let number = AttributeValue::Number(value);
        prop_assert_eq!(number.cast(AttributeType::Number), Some(number.clone()));
    }
}

// Property: the JSON coercion only accepts shapes matching the declared
// type, and accepted values keep their numeric meaning
proptest! {
    #[test]
    fn prop_json_integer_coercion(value in -1_000_000i64..1_000_000) {
        let json = serde_json::json!(value);
        prop_assert_eq!(
            AttributeValue::from_json(AttributeType::Integer, &json),
            Some(AttributeValue::Integer(value))
        );
        // Declared BOOLEAN never accepts a number
        prop_assert_eq!(AttributeValue::from_json(AttributeType::Boolean, &json), None);
    }
}

// Property: every numeric view agrees with the original value
proptest! {
    #[test]
    fn prop_as_f64_is_faithful(value in -1_000_000i64..1_000_000) {
        prop_assert_eq!(AttributeValue::Integer(value).as_f64(), Some(value as f64));
        prop_assert_eq!(AttributeValue::Datetime(value).as_f64(), Some(value as f64));
    }
}
