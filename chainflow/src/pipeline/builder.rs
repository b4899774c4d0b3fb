//! Pipeline builder: plan, resolve converters, bind components.

use super::converter::{self, construction_args, ListEntry, ResolvedConverters, ResolvedValue};
use super::planner::{self, NodeKind};
use super::resolved::{
    BoundComponent, BoundStage, ExecutionPlanNode, InputBinding, Instantiation, ResolvedPipeline,
};
use crate::components::{BuildScope, ComponentHandle, ComponentRegistry, FactoryRegistry};
use crate::config::{ComponentSpec, ConverterKind, EngineSettings, PipelineSpec};
use crate::errors::{ChainflowError, ConstructionError, PlanError};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::info;

/// Builds [`ResolvedPipeline`]s from pipeline definitions.
#[derive(Debug, Clone)]
pub struct PipelineBuilder<'a> {
    factories: &'a FactoryRegistry,
    registry: &'a ComponentRegistry,
    settings: EngineSettings,
    scope: BuildScope,
    owns_scope: bool,
}

impl<'a> PipelineBuilder<'a> {
    /// Creates a builder with default settings and a fresh build scope.
    #[must_use]
    pub fn new(factories: &'a FactoryRegistry, registry: &'a ComponentRegistry) -> Self {
        Self {
            factories,
            registry,
            settings: EngineSettings::default(),
            scope: BuildScope::new(),
            owns_scope: true,
        }
    }

    /// Sets the engine settings.
    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the build scope. Builds sharing a scope share their singletons.
    #[must_use]
    pub fn with_scope(mut self, scope: BuildScope) -> Self {
        self.scope = scope;
        self.owns_scope = false;
        self
    }

    /// The scope shared components are constructed in.
    #[must_use]
    pub fn scope(&self) -> BuildScope {
        self.scope
    }

    /// Builds a runnable pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first configuration, planning, conversion or construction
    /// error. Nothing is kept on failure: when the builder created its own
    /// scope and no earlier build populated it, the shared singletons built so
    /// far are released. A scope passed to [`PipelineBuilder::with_scope`] is
    /// left to its owner.
    pub fn build(&self, name: &str, spec: &PipelineSpec) -> Result<ResolvedPipeline, ChainflowError> {
        let fresh = self.owns_scope && !self.registry.contains_scope(self.scope);
        match self.assemble(name, spec) {
            Ok(pipeline) => Ok(pipeline),
            Err(err) => {
                if fresh {
                    self.registry.release(self.scope);
                }
                Err(err)
            }
        }
    }

    fn assemble(&self, name: &str, spec: &PipelineSpec) -> Result<ResolvedPipeline, ChainflowError> {
        spec.validate(name)?;
        let plan = planner::plan(name, spec)?;
        let ctx = BuildContext::new(name, spec, self.scope, self.factories, self.registry);
        let converters = converter::resolve(spec, &plan, &ctx)?;

        let mut instantiation = converter_instantiation(&converters, &ctx);
        let mut nodes = Vec::with_capacity(plan.len());

        for node in plan.nodes() {
            let mut input_bindings: Vec<InputBinding> = node
                .dependencies
                .iter()
                .cloned()
                .map(InputBinding::Predecessor)
                .collect();

            let bound = match node.kind {
                NodeKind::Converter => BoundStage::Converter {
                    target: node.name.clone(),
                },
                NodeKind::Component => {
                    let component = spec.component(&node.name).ok_or_else(|| PlanError::UnresolvedToken {
                        pipeline: name.to_string(),
                        token: node.name.clone(),
                    })?;

                    for key in component.param.keys() {
                        if let Some(conv) = converters.get(key) {
                            input_bindings.push(InputBinding::Param {
                                param: key.clone(),
                                target: conv.target.clone(),
                            });
                        }
                    }

                    let bound = self.bind(component, &converters, &ctx)?;
                    instantiation.insert(bound.identity.clone(), bound.instantiation);
                    BoundStage::Component(bound)
                }
            };

            nodes.push(ExecutionPlanNode {
                stage_name: node.name.clone(),
                bound,
                input_bindings,
            });
        }

        let position: HashMap<&str, usize> = plan
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();
        let waves = plan
            .waves()
            .iter()
            .map(|wave| wave.iter().filter_map(|n| position.get(n.name.as_str()).copied()).collect())
            .collect();

        info!(
            pipeline = %name,
            scope = %self.scope,
            stages = nodes.len(),
            converters = converters.len(),
            "Built pipeline"
        );

        Ok(ResolvedPipeline {
            name: name.to_string(),
            scope: self.scope,
            nodes,
            waves,
            converters,
            instantiation,
            terminals: plan.terminals().to_vec(),
            settings: self.settings.clone(),
        })
    }

    fn bind(
        &self,
        component: &ComponentSpec,
        converters: &ResolvedConverters,
        ctx: &BuildContext<'_>,
    ) -> Result<BoundComponent, ConstructionError> {
        Ok(BoundComponent {
            identity: component.identity().to_string(),
            kind: component.name.clone(),
            handle: ctx.instantiate(component, converters)?,
            params: component.param.clone(),
            max_retry: component.max_retry().unwrap_or(self.settings.default_max_retry),
            timeout_ms: component.timeout_ms().or(self.settings.stage_timeout_ms),
            instantiation: ctx.instantiation(component.identity()),
        })
    }
}

fn converter_instantiation(
    converters: &ResolvedConverters,
    ctx: &BuildContext<'_>,
) -> BTreeMap<String, Instantiation> {
    let mut record = BTreeMap::new();
    for conv in converters.iter() {
        match &conv.value {
            ResolvedValue::Instance { source, .. } => {
                record.insert(source.clone(), Instantiation::Shared);
            }
            ResolvedValue::List(entries) => {
                for entry in entries {
                    if let ListEntry::Component { identity, .. } = entry {
                        record.insert(identity.clone(), ctx.instantiation(identity));
                    }
                }
            }
            ResolvedValue::Literal(_) => {}
        }
    }
    record
}

/// State shared by the steps of one build.
pub struct BuildContext<'a> {
    pub(crate) pipeline: &'a str,
    scope: BuildScope,
    factories: &'a FactoryRegistry,
    registry: &'a ComponentRegistry,
    shared: HashSet<String>,
}

impl<'a> BuildContext<'a> {
    /// Creates the context for building `spec` in `scope`.
    #[must_use]
    pub fn new(
        pipeline: &'a str,
        spec: &PipelineSpec,
        scope: BuildScope,
        factories: &'a FactoryRegistry,
        registry: &'a ComponentRegistry,
    ) -> Self {
        let shared = spec
            .converters
            .iter()
            .filter(|rule| rule.kind == ConverterKind::Instance)
            .flat_map(|rule| rule.sources.iter())
            .filter_map(|source| spec.component(source))
            .map(|component| component.identity().to_ascii_lowercase())
            .collect();

        Self {
            pipeline,
            scope,
            factories,
            registry,
            shared,
        }
    }

    /// Components referenced by an `instance` converter are shared.
    #[must_use]
    pub fn instantiation(&self, identity: &str) -> Instantiation {
        if self.shared.contains(&identity.to_ascii_lowercase()) {
            Instantiation::Shared
        } else {
            Instantiation::PerUse
        }
    }

    /// Obtains an instance of `component`: the scope singleton when shared,
    /// a fresh one otherwise.
    ///
    /// # Errors
    ///
    /// Returns the factory's [`ConstructionError`].
    pub fn instantiate(
        &self,
        component: &ComponentSpec,
        converters: &ResolvedConverters,
    ) -> Result<ComponentHandle, ConstructionError> {
        let args = construction_args(component, converters);
        match self.instantiation(component.identity()) {
            Instantiation::Shared => self
                .registry
                .get_or_create(self.scope, component.identity(), || self.factories.construct(&args)),
            Instantiation::PerUse => self.factories.construct(&args),
        }
    }
}
