//! The immutable, runnable form of a pipeline.

use super::converter::ResolvedConverters;
use crate::components::{BuildScope, ComponentHandle};
use crate::config::{EngineSettings, ParamMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a component instance is obtained during a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instantiation {
    /// One instance per build scope, shared through the component registry.
    /// Chosen for components referenced by an `instance` converter.
    Shared,
    /// A fresh instance for every plan node or list entry using it.
    PerUse,
}

/// Where a stage's inputs come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputBinding {
    /// The output of an upstream stage.
    Predecessor(String),
    /// A converter value injected into a top-level parameter.
    Param {
        /// The parameter key.
        param: String,
        /// The converter target providing the value.
        target: String,
    },
}

/// A component bound to a stage.
#[derive(Debug, Clone)]
pub struct BoundComponent {
    /// The identity the stage refers to.
    pub identity: String,
    /// The component type name.
    pub kind: String,
    /// The constructed instance.
    pub handle: ComponentHandle,
    /// Literal parameters as configured, placeholders unrendered.
    pub params: ParamMap,
    /// Retries allowed after the first attempt.
    pub max_retry: usize,
    /// Per-invocation timeout.
    pub timeout_ms: Option<u64>,
    /// How the instance was obtained.
    pub instantiation: Instantiation,
}

/// What a stage runs.
#[derive(Debug, Clone)]
pub enum BoundStage {
    /// A component invocation.
    Component(BoundComponent),
    /// A converter producing its value.
    Converter {
        /// The converter target name.
        target: String,
    },
}

/// One stage of a resolved pipeline.
#[derive(Debug, Clone)]
pub struct ExecutionPlanNode {
    /// The stage name.
    pub stage_name: String,
    /// What the stage runs.
    pub bound: BoundStage,
    /// Where the stage's inputs come from.
    pub input_bindings: Vec<InputBinding>,
}

impl ExecutionPlanNode {
    /// Names of the upstream stages.
    pub fn predecessors(&self) -> impl Iterator<Item = &str> {
        self.input_bindings.iter().filter_map(|binding| match binding {
            InputBinding::Predecessor(stage) => Some(stage.as_str()),
            InputBinding::Param { .. } => None,
        })
    }

    /// The bound component, unless this is a converter stage.
    #[must_use]
    pub fn component(&self) -> Option<&BoundComponent> {
        match &self.bound {
            BoundStage::Component(component) => Some(component),
            BoundStage::Converter { .. } => None,
        }
    }
}

/// A pipeline ready to run. Immutable and reusable across invocations.
#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
    pub(crate) name: String,
    pub(crate) scope: BuildScope,
    pub(crate) nodes: Vec<ExecutionPlanNode>,
    pub(crate) waves: Vec<Vec<usize>>,
    pub(crate) converters: ResolvedConverters,
    pub(crate) instantiation: BTreeMap<String, Instantiation>,
    pub(crate) terminals: Vec<String>,
    pub(crate) settings: EngineSettings,
}

impl ResolvedPipeline {
    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The build scope its shared components live in.
    #[must_use]
    pub fn scope(&self) -> BuildScope {
        self.scope
    }

    /// Stages in topological order.
    #[must_use]
    pub fn nodes(&self) -> &[ExecutionPlanNode] {
        &self.nodes
    }

    /// Finds a stage by name, ignoring ASCII case.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ExecutionPlanNode> {
        self.nodes.iter().find(|n| n.stage_name.eq_ignore_ascii_case(name))
    }

    /// Stages grouped into concurrently runnable waves.
    pub fn waves(&self) -> impl Iterator<Item = Vec<&ExecutionPlanNode>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().filter_map(|&i| self.nodes.get(i)).collect())
    }

    /// The resolved converter values.
    #[must_use]
    pub fn converters(&self) -> &ResolvedConverters {
        &self.converters
    }

    /// How each constructed component was obtained, by identity.
    #[must_use]
    pub fn instantiation(&self) -> &BTreeMap<String, Instantiation> {
        &self.instantiation
    }

    /// Stages whose outputs form the result.
    #[must_use]
    pub fn terminals(&self) -> &[String] {
        &self.terminals
    }

    /// The settings it was built with.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}
