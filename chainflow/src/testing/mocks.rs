//! Mock components for testing.

use crate::components::{Component, ComponentArgs, ComponentHandle, FactoryRegistry, StageCall};
use crate::config::ParamMap;
use crate::errors::ComponentError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One invocation seen by a [`RecordingComponent`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// The stage that invoked the component.
    pub stage: String,
    /// Parameters after rendering and converter injection.
    pub params: ParamMap,
    /// The sole upstream output, if any.
    pub input: Option<Value>,
    /// All upstream outputs.
    pub inputs: BTreeMap<String, Value>,
    /// Names of the injected component references, sorted.
    pub instances: Vec<String>,
}

impl From<&StageCall> for RecordedCall {
    fn from(call: &StageCall) -> Self {
        let mut instances: Vec<String> = call.instances.keys().cloned().collect();
        instances.sort();
        Self {
            stage: call.stage.clone(),
            params: call.params.clone(),
            input: call.input.clone(),
            inputs: call.inputs.clone(),
            instances,
        }
    }
}

/// A component that records calls and returns a configurable output.
///
/// Without a configured output it echoes its input, or `null`.
#[derive(Debug)]
pub struct RecordingComponent {
    name: String,
    output: Mutex<Option<Value>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingComponent {
    /// Creates a recording component.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sets the output to return.
    #[must_use]
    pub fn with_output(self, output: Value) -> Self {
        *self.output.lock() = Some(output);
        self
    }

    /// Replaces the output to return.
    pub fn set_output(&self, output: Value) {
        *self.output.lock() = Some(output);
    }

    /// Returns the number of times the component was invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Forgets recorded calls.
    pub fn reset(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl Component for RecordingComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, call: &StageCall) -> Result<Value, ComponentError> {
        self.calls.lock().push(RecordedCall::from(call));
        Ok(self
            .output
            .lock()
            .clone()
            .or_else(|| call.input.clone())
            .unwrap_or(Value::Null))
    }
}

/// A component that fails transiently a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FlakyComponent {
    name: String,
    failures: usize,
    output: Value,
    calls: Mutex<usize>,
}

impl FlakyComponent {
    /// Creates a component failing `failures` times before returning `output`.
    #[must_use]
    pub fn new(name: impl Into<String>, failures: usize, output: Value) -> Self {
        Self {
            name: name.into(),
            failures,
            output,
            calls: Mutex::new(0),
        }
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Component for FlakyComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _call: &StageCall) -> Result<Value, ComponentError> {
        let attempt = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        if attempt <= self.failures {
            Err(ComponentError::transient(format!("{} unavailable (call {attempt})", self.name)))
        } else {
            Ok(self.output.clone())
        }
    }
}

/// A component that always fails.
#[derive(Debug)]
pub struct FailingComponent {
    name: String,
    message: String,
    transient: bool,
    calls: Mutex<usize>,
}

impl FailingComponent {
    /// Creates a component failing with a retryable error.
    #[must_use]
    pub fn transient(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, message, true)
    }

    /// Creates a component failing with a non-retryable error.
    #[must_use]
    pub fn permanent(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, message, false)
    }

    fn new(name: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            transient,
            calls: Mutex::new(0),
        }
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Component for FailingComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _call: &StageCall) -> Result<Value, ComponentError> {
        *self.calls.lock() += 1;
        if self.transient {
            Err(ComponentError::transient(self.message.clone()))
        } else {
            Err(ComponentError::permanent(self.message.clone()))
        }
    }
}

/// A chat prompt builder: turns one parameter into a `{role, content}` message.
#[derive(Debug)]
pub struct PromptComponent {
    name: String,
    role: String,
    key: String,
}

impl PromptComponent {
    /// Creates a prompt whose content is read from parameter `key`.
    #[must_use]
    pub fn new(name: impl Into<String>, role: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl Component for PromptComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, call: &StageCall) -> Result<Value, ComponentError> {
        Ok(self.as_parameter(&call.params))
    }

    fn as_parameter(&self, params: &ParamMap) -> Value {
        json!({
            "role": self.role,
            "content": params.get(&self.key).cloned().unwrap_or(Value::Null),
        })
    }
}

/// A component that sleeps before echoing its input.
#[derive(Debug)]
pub struct SlowComponent {
    name: String,
    delay: Duration,
    calls: Mutex<usize>,
}

impl SlowComponent {
    /// Creates a component taking `delay` per invocation.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            calls: Mutex::new(0),
        }
    }

    /// Returns the number of invocations started.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Component for SlowComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, call: &StageCall) -> Result<Value, ComponentError> {
        *self.calls.lock() += 1;
        tokio::time::sleep(self.delay).await;
        Ok(call.input.clone().unwrap_or_else(|| json!(self.name)))
    }
}

/// A factory building a fresh [`RecordingComponent`] named after the identity.
pub fn recording_factory() -> impl Fn(&ComponentArgs) -> anyhow::Result<ComponentHandle> + Send + Sync + 'static {
    |args: &ComponentArgs| Ok(Arc::new(RecordingComponent::new(args.identity.clone())) as ComponentHandle)
}

/// A factory that always hands out the same instance.
pub fn shared_factory<C>(component: Arc<C>) -> impl Fn(&ComponentArgs) -> anyhow::Result<ComponentHandle> + Send + Sync + 'static
where
    C: Component + 'static,
{
    move |_args: &ComponentArgs| Ok(Arc::clone(&component) as ComponentHandle)
}

/// Registers `SystemPrompt` (role `system`, parameter `system_prompt`) and
/// `HumanPrompt` (role `user`, parameter `human_message`).
pub fn register_prompt_factories(factories: &FactoryRegistry) {
    factories.register("SystemPrompt", |args: &ComponentArgs| {
        Ok(Arc::new(PromptComponent::new(args.identity.clone(), "system", "system_prompt")) as ComponentHandle)
    });
    factories.register("HumanPrompt", |args: &ComponentArgs| {
        Ok(Arc::new(PromptComponent::new(args.identity.clone(), "user", "human_message")) as ComponentHandle)
    });
}
