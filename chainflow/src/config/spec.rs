//! Pipeline, converter and component definitions.

use crate::errors::ConfigError;
use crate::template;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Constructor parameters of a component: a possibly nested JSON-like map.
pub type ParamMap = Map<String, Value>;

/// One named pipeline: an execution path plus the converters and components
/// it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Hyphen-delimited chain of stage tokens.
    #[serde(rename = "excute_path", alias = "execute_path")]
    pub execution_path: String,
    /// Converter rules, in declaration order.
    #[serde(rename = "converter", alias = "converters", default, deserialize_with = "null_as_default")]
    pub converters: Vec<ConverterRule>,
    /// Component constructor configurations.
    #[serde(default, deserialize_with = "null_as_default")]
    pub components: Vec<ComponentSpec>,
}

impl PipelineSpec {
    /// Creates a pipeline with the given execution path and nothing else.
    #[must_use]
    pub fn new(execution_path: impl Into<String>) -> Self {
        Self {
            execution_path: execution_path.into(),
            converters: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Appends a converter rule.
    #[must_use]
    pub fn with_converter(mut self, rule: ConverterRule) -> Self {
        self.converters.push(rule);
        self
    }

    /// Appends a component configuration.
    #[must_use]
    pub fn with_component(mut self, component: ComponentSpec) -> Self {
        self.components.push(component);
        self
    }

    /// Finds a component by identity (alias or name), ignoring ASCII case.
    #[must_use]
    pub fn component(&self, identity: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.matches(identity))
    }

    /// Finds a converter by target name, ignoring ASCII case.
    #[must_use]
    pub fn converter(&self, target: &str) -> Option<&ConverterRule> {
        self.converters.iter().find(|c| c.target_name.eq_ignore_ascii_case(target))
    }

    /// Returns true if any component parameter contains a runtime placeholder.
    #[must_use]
    pub fn has_runtime_parameters(&self) -> bool {
        self.components
            .iter()
            .any(|c| !template::placeholders(&Value::Object(c.param.clone())).is_empty())
    }

    /// Checks that component identities are unique.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateComponent`] on the first duplicate.
    pub fn validate(&self, pipeline: &str) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for component in &self.components {
            if !seen.insert(component.identity().to_ascii_lowercase()) {
                return Err(ConfigError::DuplicateComponent {
                    pipeline: pipeline.to_string(),
                    component: component.identity().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// How a converter turns its sources into a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterKind {
    /// Ordered aggregation of the sources' rendered payloads.
    List,
    /// Shared reference to the single source component.
    Instance,
    /// The raw value, used as a literal string.
    #[serde(rename = "str", alias = "literal")]
    Literal,
}

impl std::fmt::Display for ConverterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::List => write!(f, "list"),
            Self::Instance => write!(f, "instance"),
            Self::Literal => write!(f, "str"),
        }
    }
}

/// A rule producing a named value from other components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterRule {
    /// The name the produced value is known by.
    #[serde(rename = "name")]
    pub target_name: String,
    /// The conversion semantics.
    #[serde(rename = "type")]
    pub kind: ConverterKind,
    /// Source names, in order. Accepts `"a,b"` or a list.
    #[serde(rename = "value", deserialize_with = "deserialize_sources")]
    pub sources: Vec<String>,
}

impl ConverterRule {
    /// Creates a `list` rule.
    #[must_use]
    pub fn list(target: impl Into<String>, sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            target_name: target.into(),
            kind: ConverterKind::List,
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates an `instance` rule.
    #[must_use]
    pub fn instance(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            target_name: target.into(),
            kind: ConverterKind::Instance,
            sources: vec![source.into()],
        }
    }

    /// Creates a `str` rule.
    #[must_use]
    pub fn literal(target: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            target_name: target.into(),
            kind: ConverterKind::Literal,
            sources: vec![value.into()],
        }
    }

    /// Returns the literal text of a `str` rule.
    #[must_use]
    pub fn literal_value(&self) -> String {
        self.sources.join(",")
    }
}

/// Constructor configuration for one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// The component type; selects the factory. Case-insensitive.
    pub name: String,
    /// Optional identity used when the same type is configured twice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Constructor parameters.
    #[serde(default, deserialize_with = "null_as_default")]
    pub param: ParamMap,
}

impl ComponentSpec {
    /// Creates a component configuration with no parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            param: ParamMap::new(),
        }
    }

    /// Sets the alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.param.insert(key.into(), value);
        self
    }

    /// The name the path and converters refer to this component by.
    #[must_use]
    pub fn identity(&self) -> &str {
        self.alias.as_deref().filter(|a| !a.is_empty()).unwrap_or(&self.name)
    }

    /// Returns true if `identity` refers to this component.
    #[must_use]
    pub fn matches(&self, identity: &str) -> bool {
        self.identity().eq_ignore_ascii_case(identity)
    }

    /// Declared retry budget: `max_retry` at the top level or one level down
    /// (e.g. `parameter.max_retry`).
    #[must_use]
    pub fn max_retry(&self) -> Option<usize> {
        self.lookup_u64("max_retry").and_then(|v| usize::try_from(v).ok())
    }

    /// Declared per-invocation timeout in milliseconds.
    #[must_use]
    pub fn timeout_ms(&self) -> Option<u64> {
        self.lookup_u64("timeout_ms")
    }

    fn lookup_u64(&self, key: &str) -> Option<u64> {
        if let Some(v) = self.param.get(key) {
            return as_u64(v);
        }
        self.param
            .values()
            .filter_map(Value::as_object)
            .find_map(|nested| nested.get(key).and_then(as_u64))
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn deserialize_sources<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Sources {
        Joined(String),
        Listed(Vec<String>),
    }

    let raw = match Sources::deserialize(deserializer)? {
        Sources::Joined(s) => s.split(',').map(str::to_string).collect::<Vec<_>>(),
        Sources::Listed(items) => items,
    };
    Ok(raw
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TEST01: &str = r#"
excute_path: messages-OpenAiStyleModel
converter:
  - name: messages
    type: list
    value: SystemPrompt, HumanPrompt
components:
  - name: SystemPrompt
    param:
      system_prompt: You are a helpful assistant.
  - name: HumanPrompt
    param:
      human_message: "{{query}}"
  - name: OpenAiStyleModel
    param:
      parameter:
        base_url: http://localhost:8000
        api_key: sk-test
        model: qwen
        max_retry: 2
"#;

    #[test]
    fn test_parse_original_layout() {
        let spec: PipelineSpec = serde_yaml::from_str(TEST01).unwrap();

        assert_eq!(spec.execution_path, "messages-OpenAiStyleModel");
        assert_eq!(
            spec.converters,
            vec![ConverterRule::list("messages", ["SystemPrompt", "HumanPrompt"])]
        );
        assert_eq!(spec.components.len(), 3);
        assert_eq!(spec.component("openaistylemodel").and_then(ComponentSpec::max_retry), Some(2));
        assert!(spec.has_runtime_parameters());
    }

    #[test]
    fn test_blank_param_and_missing_converters() {
        let yaml = r"
excute_path: ChromaUpsertStore
components:
  - name: ChromaUpsertStore
    param:
      collection: docs
      embedding_func:
  - name: TextSplitter
    param:
";
        let spec: PipelineSpec = serde_yaml::from_str(yaml).unwrap();

        assert!(spec.converters.is_empty());
        let store = spec.component("ChromaUpsertStore").unwrap();
        assert_eq!(store.param.get("embedding_func"), Some(&Value::Null));
        assert!(spec.component("TextSplitter").unwrap().param.is_empty());
        assert!(!spec.has_runtime_parameters());
    }

    #[test]
    fn test_sources_as_list_and_literal_kind() {
        let rule: ConverterRule =
            serde_json::from_value(json!({"name": "collection", "type": "str", "value": "docs"})).unwrap();
        assert_eq!(rule.kind, ConverterKind::Literal);
        assert_eq!(rule.literal_value(), "docs");

        let rule: ConverterRule =
            serde_json::from_value(json!({"name": "m", "type": "list", "value": ["a", " b "]})).unwrap();
        assert_eq!(rule.sources, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_unknown_converter_kind_rejected() {
        let result: Result<ConverterRule, _> =
            serde_json::from_value(json!({"name": "m", "type": "tuple", "value": "a"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_alias_identity() {
        let spec = ComponentSpec::new("OpenAiStyleEmbeddings").with_alias("query_embedder");
        assert_eq!(spec.identity(), "query_embedder");
        assert!(spec.matches("QUERY_EMBEDDER"));
        assert!(!spec.matches("OpenAiStyleEmbeddings"));
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let spec = PipelineSpec::new("a")
            .with_component(ComponentSpec::new("A"))
            .with_component(ComponentSpec::new("a"));

        assert!(matches!(
            spec.validate("p"),
            Err(ConfigError::DuplicateComponent { ref component, .. }) if component == "a"
        ));
    }

    #[test]
    fn test_max_retry_top_level_and_string() {
        let spec = ComponentSpec::new("X").with_param("max_retry", json!("4"));
        assert_eq!(spec.max_retry(), Some(4));
        assert_eq!(ComponentSpec::new("Y").max_retry(), None);
    }
}
