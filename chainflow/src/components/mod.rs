//! Components and their construction.
//!
//! Components are the external collaborators a pipeline wires together:
//! prompt builders, model clients, vector stores and the like. The engine
//! only sees them through the [`Component`] trait and constructs them through
//! factories registered by name.

mod factory;
mod registry;

pub use factory::{
    clear_factories, global_factories, register_factory, ComponentFactory, FactoryRegistry,
};
pub use registry::{BuildScope, ComponentRegistry};

use crate::config::ParamMap;
use crate::errors::ComponentError;
use crate::template::Bindings;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

/// A unit of work wired into a pipeline.
#[async_trait]
pub trait Component: Send + Sync + Debug {
    /// Returns the component type name.
    fn name(&self) -> &str;

    /// Invokes the component for one pipeline stage.
    ///
    /// Failures that may succeed on retry (network errors, timeouts) should
    /// be reported with [`ComponentError::transient`].
    async fn invoke(&self, call: &StageCall) -> Result<Value, ComponentError>;

    /// Turns rendered parameters into the payload a `list` converter
    /// aggregates. Prompt components return e.g. `{role, content}`.
    fn as_parameter(&self, params: &ParamMap) -> Value {
        Value::Object(params.clone())
    }
}

/// A shared handle to a constructed component.
pub type ComponentHandle = Arc<dyn Component>;

/// Everything a component receives for one invocation.
#[derive(Debug, Clone, Default)]
pub struct StageCall {
    /// The stage being run.
    pub stage: String,
    /// Rendered parameters, with converter values injected.
    pub params: ParamMap,
    /// Output of the sole predecessor, if there is exactly one.
    pub input: Option<Value>,
    /// Outputs of all predecessors, by stage name.
    pub inputs: BTreeMap<String, Value>,
    /// Shared component references, by converter target or parameter name.
    pub instances: HashMap<String, ComponentHandle>,
    /// The runtime bindings of this invocation.
    pub bindings: Bindings,
}

impl StageCall {
    /// Creates a call for a stage with no parameters or inputs.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Self::default()
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: ParamMap) -> Self {
        self.params = params;
        self
    }

    /// Sets the sole input.
    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Gets a parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Gets a shared component reference.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<&ComponentHandle> {
        self.instances.get(name)
    }
}

/// Arguments handed to a factory when constructing a component.
#[derive(Debug, Clone, Default)]
pub struct ComponentArgs {
    /// The identity (alias or name) the component is known by.
    pub identity: String,
    /// The component type name that selected the factory.
    pub kind: String,
    /// Literal parameters, with `str` converter values injected.
    pub params: ParamMap,
    /// Shared component references injected by `instance` converters.
    pub instances: HashMap<String, ComponentHandle>,
}

impl ComponentArgs {
    /// Creates arguments for a component with no parameters.
    #[must_use]
    pub fn new(identity: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: ParamMap) -> Self {
        self.params = params;
        self
    }

    /// Gets a parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Gets a string parameter.
    #[must_use]
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Gets an injected component reference.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<&ComponentHandle> {
        self.instances.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl Component for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn invoke(&self, call: &StageCall) -> Result<Value, ComponentError> {
            Ok(call.input.clone().unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_default_as_parameter_is_params() {
        let echo = Echo;
        let mut params = ParamMap::new();
        params.insert("k".to_string(), json!("v"));

        assert_eq!(echo.as_parameter(&params), json!({"k": "v"}));
        let out = echo.invoke(&StageCall::new("echo").with_input(json!(1))).await.unwrap();
        assert_eq!(out, json!(1));
    }

    #[test]
    fn test_args_accessors() {
        let mut params = ParamMap::new();
        params.insert("collection".to_string(), json!("docs"));
        let args = ComponentArgs::new("store", "ChromaUpsertStore").with_params(params);

        assert_eq!(args.str_param("collection"), Some("docs"));
        assert!(args.instance("embedding_func").is_none());
    }
}
