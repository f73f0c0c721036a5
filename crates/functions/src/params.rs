//! Policy function parameter access
//!
//! Parameters arrive as the raw JSON object of the policy descriptor.
//! Accessors are lenient the way the wire format is in practice: numbers
//! may be JSON numbers or numeric strings.

use serde_json::{Map, Value};

/// Borrowed view over one policy function's `parameters` object
#[derive(Debug, Clone, Copy)]
pub struct Parameters<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Parameters<'a> {
    pub fn new(map: &'a Map<String, Value>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key)
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        match self.map.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.map.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&'a str> {
        self.map.get(key)?.as_str()
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.map.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// `window` in milliseconds
    pub fn window_ms(&self) -> Option<i64> {
        self.i64("window").filter(|w| *w > 0)
    }

    /// `slide` in milliseconds, defaulting to the window length
    pub fn slide_ms(&self, window_ms: i64) -> i64 {
        self.i64("slide").filter(|s| *s > 0).unwrap_or(window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_numeric_leniency() {
        let map = params(json!({"a": 5, "b": "7", "c": 2.5, "d": true}));
        let p = Parameters::new(&map);

        assert_eq!(p.i64("a"), Some(5));
        assert_eq!(p.i64("b"), Some(7));
        assert_eq!(p.f64("c"), Some(2.5));
        assert_eq!(p.i64("d"), None);
        assert_eq!(p.i64("missing"), None);
    }

    #[test]
    fn test_window_and_slide_defaults() {
        let map = params(json!({"window": 10000}));
        let p = Parameters::new(&map);
        let window = p.window_ms().unwrap();
        assert_eq!(window, 10000);
        assert_eq!(p.slide_ms(window), 10000);

        let map = params(json!({"window": 10000, "slide": 5000}));
        let p = Parameters::new(&map);
        assert_eq!(p.slide_ms(p.window_ms().unwrap()), 5000);
    }

    #[test]
    fn test_nonpositive_window_rejected() {
        let map = params(json!({"window": 0}));
        assert_eq!(Parameters::new(&map).window_ms(), None);
    }

    #[test]
    fn test_bool_from_string() {
        let map = params(json!({"filter": "false"}));
        assert_eq!(Parameters::new(&map).bool("filter"), Some(false));
    }
}
