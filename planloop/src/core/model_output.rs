//! Tolerant parsing of structured data out of model replies.
//!
//! Model output is unreliable: JSON may be wrapped in code fences or prose,
//! keys vary in case and naming, and sometimes nothing parses at all. None of
//! these functions fail; they degrade to `None`, an empty list, or `finish`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::types::{Action, ActionKind};

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*\n?(.*?)```").expect("fence regex should be valid")
});

/// A ReAct next-step decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Act(Action),
    /// `explicit` is false when the reply could not be read as a decision.
    Finish { answer: Option<String>, explicit: bool },
}

/// Pull the first JSON object or array out of free-form model text.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }
    for caps in FENCE_RE.captures_iter(trimmed) {
        if let Some(body) = caps.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim()) {
                return Some(value);
            }
        }
    }
    outermost_span(trimmed, '{', '}')
        .or_else(|| outermost_span(trimmed, '[', ']'))
        .and_then(|span| serde_json::from_str(span).ok())
}

/// Structured view of a model result: JSON values pass through, strings are
/// mined for embedded JSON.
pub fn structured(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) | Value::Array(_) => Some(value.clone()),
        Value::String(text) => extract_json(text),
        _ => None,
    }
}

/// Actions from a planning reply shaped like `{"actions": [...]}`.
///
/// A bare array of actions or a single action object is accepted too.
/// Entries that are not recognizable actions are skipped.
pub fn extract_actions(content: &Value) -> Vec<Action> {
    let Some(json) = structured(content) else {
        return Vec::new();
    };
    let entries = match &json {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match field(map, &["actions", "steps", "plan"]) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => Vec::new(),
            None => vec![json.clone()],
        },
        _ => Vec::new(),
    };
    entries.iter().filter_map(action_from_value).collect()
}

/// Interpret one action object.
pub fn action_from_value(value: &Value) -> Option<Action> {
    let map = value.as_object()?;
    let name = field(map, &["name", "tool", "target", "targetName", "function"])
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let kind = match field(map, &["type", "actionType", "action_type", "kind"]) {
        Some(Value::String(text)) => ActionKind::parse(text)?,
        Some(_) => return None,
        None if !name.is_empty() => ActionKind::Tool,
        None => return None,
    };
    if kind != ActionKind::Finish && name.is_empty() {
        return None;
    }
    let parameters = field(map, &["parameters", "params", "arguments", "args", "input"])
        .filter(|params| !params.is_null())
        .cloned();
    let output_variable = field(map, &["outputVariable", "output_variable"])
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(Action {
        kind,
        name,
        parameters,
        output_variable,
    })
}

/// Decide the next ReAct move. Anything unusable means finish.
pub fn parse_decision(content: &Value) -> Decision {
    let Some(json) = structured(content) else {
        return Decision::Finish {
            answer: None,
            explicit: false,
        };
    };
    let action_value = match json.as_object().and_then(|map| field(map, &["action", "decision"])) {
        Some(nested @ Value::Object(_)) => nested.clone(),
        _ => json.clone(),
    };
    let answer = answer_text(&json).or_else(|| answer_text(&action_value));
    match action_from_value(&action_value) {
        Some(action) if action.kind != ActionKind::Finish => Decision::Act(action),
        Some(_) => Decision::Finish {
            answer,
            explicit: true,
        },
        None => Decision::Finish {
            answer,
            explicit: false,
        },
    }
}

/// Completion verdict from a checker reply, if one can be read.
pub fn parse_completion(content: &Value) -> Option<bool> {
    if let Some(flag) = content.as_bool() {
        return Some(flag);
    }
    if let Some(json) = structured(content) {
        let map = json.as_object()?;
        return field(
            map,
            &[
                "isComplete",
                "is_complete",
                "complete",
                "goalAchieved",
                "goal_achieved",
                "achieved",
                "done",
            ],
        )
        .and_then(truthy);
    }
    content.as_str().and_then(|text| truthy(&Value::String(text.to_string())))
}

/// Explicit success/error indicator carried by a structured result.
pub fn success_indicator(value: &Value) -> Option<(bool, Option<String>)> {
    let map = value.as_object()?;
    let flag = field(map, &["isSuccess", "is_success", "success"])?.as_bool()?;
    let error = field(map, &["errorMessage", "error_message", "error"])
        .and_then(Value::as_str)
        .filter(|msg| !msg.trim().is_empty())
        .map(str::to_string);
    Some((flag, error))
}

/// Case-insensitive lookup across alternative key spellings.
pub fn field<'a>(map: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| {
        map.get(*name).or_else(|| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    })
}

fn answer_text(value: &Value) -> Option<String> {
    let map = value.as_object()?;
    field(map, &["answer", "finalAnswer", "final_answer", "result"])
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => {
            let lowered = text.trim().to_ascii_lowercase();
            let first = lowered
                .split(|c: char| !c.is_ascii_alphanumeric())
                .find(|word| !word.is_empty())?;
            match first {
                "true" | "yes" | "complete" | "completed" | "done" => Some(true),
                "false" | "no" | "incomplete" | "not" => Some(false),
                _ => None,
            }
        }
        _ => None,
    }
}

fn outermost_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_json_handles_fences_and_prose() {
        let fenced = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json(fenced), Some(json!({"a": 1})));
        let prose = "The plan is {\"actions\": []} as requested.";
        assert_eq!(extract_json(prose), Some(json!({"actions": []})));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("42"), None);
    }

    #[test]
    fn extract_actions_reads_actions_array() {
        let content = json!(
            r#"{"actions": [
                {"type": "tool", "name": "ReadFile", "parameters": {"path": "a.txt"}},
                {"type": "function", "name": "summarizer"},
                {"type": "tool"},
                "junk"
            ]}"#
        );
        let actions = extract_actions(&content);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].name, "ReadFile");
        assert_eq!(actions[0].parameters, Some(json!({"path": "a.txt"})));
        assert_eq!(actions[1].kind, ActionKind::Function);
    }

    #[test]
    fn extract_actions_degrades_to_empty() {
        assert!(extract_actions(&json!("not a plan")).is_empty());
        assert!(extract_actions(&json!({"actions": "nope"})).is_empty());
        assert!(extract_actions(&Value::Null).is_empty());
    }

    #[test]
    fn parse_decision_variants() {
        assert_eq!(
            parse_decision(&json!({"type": "finish", "answer": "42"})),
            Decision::Finish {
                answer: Some("42".to_string()),
                explicit: true,
            }
        );
        assert_eq!(
            parse_decision(&json!("garbage")),
            Decision::Finish {
                answer: None,
                explicit: false,
            }
        );
        match parse_decision(&json!({"thought": "x", "action": {"type": "tool", "name": "Echo"}})) {
            Decision::Act(action) => assert_eq!(action.name, "Echo"),
            other => panic!("expected action, got {other:?}"),
        }
    }

    #[test]
    fn parse_completion_variants() {
        assert_eq!(parse_completion(&json!({"isComplete": true})), Some(true));
        assert_eq!(parse_completion(&json!({"goal_achieved": "no"})), Some(false));
        assert_eq!(parse_completion(&json!("Yes, the goal is met.")), Some(true));
        assert_eq!(parse_completion(&json!(false)), Some(false));
        assert_eq!(parse_completion(&json!({"other": 1})), None);
    }

    /// Only the whole first word counts, so "nothing" is not read as "no".
    #[test]
    fn parse_completion_matches_whole_first_word() {
        assert_eq!(
            parse_completion(&json!("Nothing remains to do; the goal is complete.")),
            None
        );
        assert_eq!(parse_completion(&json!("Notably, work continues.")), None);
        assert_eq!(parse_completion(&json!("Done!")), Some(true));
        assert_eq!(parse_completion(&json!("Not yet.")), Some(false));
        assert_eq!(parse_completion(&json!("  incomplete: two files left")), Some(false));
    }

    #[test]
    fn success_indicator_requires_boolean_flag() {
        assert_eq!(
            success_indicator(&json!({"IsSuccess": false, "ErrorMessage": "bad input"})),
            Some((false, Some("bad input".to_string())))
        );
        assert_eq!(success_indicator(&json!({"success": "yes"})), None);
        assert_eq!(success_indicator(&json!({"summary": "x"})), None);
    }
}
