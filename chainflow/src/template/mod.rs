//! Parameter template rendering.
//!
//! Component parameters may contain `{{ name }}` placeholders that are filled
//! from runtime bindings at invocation time. Rendering is a pure pass that
//! produces a fresh tree and never touches the configured parameters.

mod bindings;

pub use bindings::Bindings;

use crate::errors::RenderError;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::OnceLock;

#[allow(clippy::expect_used)]
fn placeholder_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// Renders every placeholder in `value` from `bindings`.
///
/// A string consisting of exactly one placeholder is replaced by the bound
/// value itself, keeping its JSON type. Placeholders embedded in longer
/// strings are interpolated as text. Non-string values pass through.
///
/// # Errors
///
/// Returns [`RenderError::MissingBinding`] for the first placeholder that has
/// no binding.
pub fn render(value: &Value, bindings: &Bindings) -> Result<Value, RenderError> {
    render_at(value, bindings, "$")
}

/// Renders each entry of a parameter map.
///
/// # Errors
///
/// Returns [`RenderError::MissingBinding`] if any placeholder is unbound.
pub fn render_params(params: &Map<String, Value>, bindings: &Bindings) -> Result<Map<String, Value>, RenderError> {
    params
        .iter()
        .map(|(key, value)| Ok((key.clone(), render_at(value, bindings, &format!("$.{key}"))?)))
        .collect()
}

/// Returns the names of all placeholders found in `value`.
#[must_use]
pub fn placeholders(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_placeholders(value, &mut names);
    names
}

fn collect_placeholders(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for caps in placeholder_regex().captures_iter(s) {
                names.insert(caps[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_placeholders(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_placeholders(v, names)),
        _ => {}
    }
}

fn render_at(value: &Value, bindings: &Bindings, path: &str) -> Result<Value, RenderError> {
    match value {
        Value::String(s) => render_string(s, bindings, path),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| render_at(v, bindings, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), render_at(v, bindings, &format!("{path}.{k}"))?)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, bindings: &Bindings, path: &str) -> Result<Value, RenderError> {
    let pattern = placeholder_regex();

    if let Some(caps) = pattern.captures(s) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        if whole == (0..s.len()) {
            return lookup(bindings, &caps[1], path).cloned();
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in pattern.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&s[last..whole.start()]);
        match lookup(bindings, &caps[1], path)? {
            Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn lookup<'a>(bindings: &'a Bindings, name: &str, path: &str) -> Result<&'a Value, RenderError> {
    bindings.resolve(name).ok_or_else(|| RenderError::MissingBinding {
        name: name.to_string(),
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn query(text: &str) -> Bindings {
        Bindings::new().with("query", json!(text))
    }

    #[test]
    fn test_whole_placeholder_substituted() {
        let rendered = render(&json!("{{query}}"), &query("hello")).unwrap();
        assert_eq!(rendered, json!("hello"));
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let bindings = Bindings::new().with("top_k", json!(5));
        let rendered = render(&json!("{{ top_k }}"), &bindings).unwrap();
        assert_eq!(rendered, json!(5));
    }

    #[test]
    fn test_embedded_placeholders_interpolated() {
        let bindings = query("rust").with("count", json!(3));
        let rendered = render(&json!("Give {{count}} facts about {{ query }}."), &bindings).unwrap();
        assert_eq!(rendered, json!("Give 3 facts about rust."));
    }

    #[test]
    fn test_missing_binding() {
        let err = render(&json!({"human_message": "{{query}}"}), &Bindings::new()).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingBinding {
                name: "query".to_string(),
                path: "$.human_message".to_string(),
            }
        );
    }

    #[test]
    fn test_nested_tree_rendered_fresh() {
        let original = json!({
            "parameter": {"model": "qwen", "max_retry": 2},
            "messages": ["static", "{{query}}"],
            "stream": false,
        });
        let rendered = render(&original, &query("hi")).unwrap();

        assert_eq!(rendered["messages"], json!(["static", "hi"]));
        assert_eq!(rendered["parameter"], json!({"model": "qwen", "max_retry": 2}));
        assert_eq!(original["messages"][1], json!("{{query}}"));
    }

    #[test]
    fn test_dotted_lookup() {
        let bindings = Bindings::new().with("user", json!({"name": "Ada"}));
        let rendered = render(&json!("Hi {{user.name}}"), &bindings).unwrap();
        assert_eq!(rendered, json!("Hi Ada"));
    }

    #[test]
    fn test_non_matching_values_pass_through() {
        let value = json!({"a": 1, "b": null, "c": "{ not a placeholder }"});
        assert_eq!(render(&value, &Bindings::new()).unwrap(), value);
    }

    #[test]
    fn test_placeholders_listed() {
        let value = json!({"a": "{{query}}", "b": ["{{ top_k }} of {{query}}"]});
        let names: Vec<_> = placeholders(&value).into_iter().collect();
        assert_eq!(names, vec!["query".to_string(), "top_k".to_string()]);
    }

    #[test]
    fn test_render_params_reports_key_path() {
        let mut params = Map::new();
        params.insert("system_prompt".to_string(), json!("{{persona}}"));
        let err = render_params(&params, &Bindings::new()).unwrap_err();
        assert!(matches!(err, RenderError::MissingBinding { ref path, .. } if path == "$.system_prompt"));
    }
}
