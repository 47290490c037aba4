//! Per-run variable store threading step outputs into later steps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// String-keyed values produced by completed steps.
///
/// Owned by exactly one run. Values are opaque: plain strings, structured
/// JSON, or strings that happen to contain JSON text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingContext {
    values: BTreeMap<String, Value>,
}

impl BindingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Bind `value` under `name`, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// JSON object view of every binding, in key order.
    pub fn snapshot(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for BindingContext {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Interpret a bound value as JSON.
///
/// Structured values are returned as-is; strings are parsed when they look
/// like a JSON object or array. Anything else is not JSON.
pub fn as_json(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) | Value::Array(_) => Some(value.clone()),
        Value::String(text) => {
            let trimmed = text.trim();
            if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
                return None;
            }
            serde_json::from_str(trimmed).ok()
        }
        _ => None,
    }
}

/// Render a value as text: strings verbatim, everything else as compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_is_ordered_object() {
        let mut ctx = BindingContext::new();
        ctx.set("b", "two");
        ctx.set("a", json!({"n": 1}));

        assert_eq!(
            serde_json::to_string(&ctx.snapshot()).expect("json"),
            r#"{"a":{"n":1},"b":"two"}"#
        );
    }

    #[test]
    fn as_json_parses_json_strings_only() {
        assert_eq!(as_json(&json!("[1,2]")), Some(json!([1, 2])));
        assert_eq!(as_json(&json!({"a": 1})), Some(json!({"a": 1})));
        assert_eq!(as_json(&json!("plain text")), None);
        assert_eq!(as_json(&json!("{not json")), None);
        assert_eq!(as_json(&json!(42)), None);
    }

    #[test]
    fn render_value_keeps_strings_verbatim() {
        assert_eq!(render_value(&json!("a \"quoted\" word")), "a \"quoted\" word");
        assert_eq!(render_value(&json!({"k": [1]})), r#"{"k":[1]}"#);
    }
}
