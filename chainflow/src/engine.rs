//! The runtime invocation facade.
//!
//! An [`Engine`] owns a configuration document, the factories that construct
//! components, the singleton registry and the event sink. It builds pipelines
//! on demand, caches those without runtime placeholders, and runs apps made
//! of several pipelines.

use crate::cancellation::CancellationToken;
use crate::components::{global_factories, BuildScope, ComponentRegistry, FactoryRegistry};
use crate::config::{ConfigDocument, EngineSettings};
use crate::errors::ChainflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::{self, PipelineBuilder, ResolvedPipeline, RunReport};
use crate::template::Bindings;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// The result of running an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppReport {
    /// The app that ran.
    pub app: String,
    /// Output of the last group: the single agent's output, or an object
    /// keyed by agent name.
    pub output: Value,
    /// Every pipeline run, group by group.
    pub runs: Vec<RunReport>,
}

/// Builds and runs the pipelines of a configuration document.
pub struct Engine {
    document: ConfigDocument,
    factories: Arc<FactoryRegistry>,
    registry: Arc<ComponentRegistry>,
    sink: Arc<dyn EventSink>,
    settings: EngineSettings,
    cache: DashMap<String, Arc<ResolvedPipeline>>,
}

impl Engine {
    /// Creates an engine using the process-wide factories, a private
    /// component registry and no event sink.
    #[must_use]
    pub fn new(document: ConfigDocument) -> Self {
        Self {
            document,
            factories: global_factories(),
            registry: Arc::new(ComponentRegistry::new()),
            sink: Arc::new(NoOpEventSink),
            settings: EngineSettings::default(),
            cache: DashMap::new(),
        }
    }

    /// Uses the given factories instead of the process-wide ones.
    #[must_use]
    pub fn with_factories(mut self, factories: Arc<FactoryRegistry>) -> Self {
        self.factories = factories;
        self
    }

    /// Uses the given component registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ComponentRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Sends lifecycle events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the engine settings.
    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The configuration document.
    #[must_use]
    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    /// The engine settings.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The component registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Builds a pipeline in a fresh scope. A failed build releases whatever
    /// it constructed.
    ///
    /// # Errors
    ///
    /// Returns any configuration, planning, conversion or construction error.
    pub fn build(&self, name: &str) -> Result<ResolvedPipeline, ChainflowError> {
        let spec = self.document.pipeline(name)?;
        self.builder().build(name, spec)
    }

    /// Builds a pipeline in `scope`. Pipelines built in one scope share their
    /// singleton components.
    ///
    /// # Errors
    ///
    /// Returns any configuration, planning, conversion or construction error.
    pub fn build_in_scope(&self, name: &str, scope: BuildScope) -> Result<ResolvedPipeline, ChainflowError> {
        let spec = self.document.pipeline(name)?;
        self.builder().with_scope(scope).build(name, spec)
    }

    fn builder(&self) -> PipelineBuilder<'_> {
        PipelineBuilder::new(&self.factories, &self.registry).with_settings(self.settings.clone())
    }

    /// Runs a pipeline with the given bindings.
    ///
    /// # Errors
    ///
    /// Returns build errors for a misconfigured pipeline and
    /// [`ChainflowError::Execution`] for a failed run.
    pub async fn execute(&self, name: &str, bindings: &Bindings) -> Result<RunReport, ChainflowError> {
        self.execute_with_cancel(name, bindings, &CancellationToken::new()).await
    }

    /// Runs a pipeline that stops when `cancel` fires.
    ///
    /// Pipelines without runtime placeholders are built once and reused when
    /// caching is enabled. Others are built per call and their scope is
    /// released afterwards.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::execute`].
    pub async fn execute_with_cancel(
        &self,
        name: &str,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<RunReport, ChainflowError> {
        let spec = self.document.pipeline(name)?;

        if self.settings.cache_static_pipelines && !spec.has_runtime_parameters() {
            let resolved = self.cached(name)?;
            return Ok(pipeline::run(&resolved, bindings, cancel, self.sink.as_ref()).await?);
        }

        let resolved = self.build(name)?;
        let result = pipeline::run(&resolved, bindings, cancel, self.sink.as_ref()).await;
        self.registry.release(resolved.scope());
        Ok(result?)
    }

    /// Runs every agent of an app, group by group in ascending run order.
    ///
    /// Agents of one group run concurrently. An agent with a `result_name`
    /// binds its output under that name for later groups.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownApp`](crate::errors::ConfigError::UnknownApp)
    /// or the first failing agent's error.
    pub async fn run_app(&self, name: &str, bindings: &Bindings) -> Result<AppReport, ChainflowError> {
        self.run_app_with_cancel(name, bindings, &CancellationToken::new()).await
    }

    /// Runs an app that stops when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::run_app`].
    pub async fn run_app_with_cancel(
        &self,
        name: &str,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<AppReport, ChainflowError> {
        let app = self.document.app(name)?;
        let mut bindings = bindings.clone();
        let mut runs = Vec::new();
        let mut output = Value::Null;

        for (order, agents) in app.order_groups() {
            info!(app = %name, order, agents = agents.len(), "Running app group");

            let results = join_all(
                agents
                    .iter()
                    .map(|agent| self.execute_with_cancel(&agent.agent_name, &bindings, cancel)),
            )
            .await;

            let mut group = Map::new();
            let mut produced = Vec::new();
            for (agent, result) in agents.iter().zip(results) {
                let report = result?;
                if let Some(result_name) = &agent.result_name {
                    produced.push((result_name.clone(), report.output.clone()));
                }
                group.insert(agent.agent_name.clone(), report.output.clone());
                runs.push(report);
            }

            for (result_name, value) in produced {
                debug!(app = %name, binding = %result_name, "Binding agent result");
                bindings.insert(result_name, value);
            }

            output = if group.len() == 1 {
                group.into_iter().next().map_or(Value::Null, |(_, value)| value)
            } else {
                Value::Object(group)
            };
        }

        Ok(AppReport {
            app: name.to_string(),
            output,
            runs,
        })
    }

    /// Number of pipelines currently cached.
    #[must_use]
    pub fn cached_pipelines(&self) -> usize {
        self.cache.len()
    }

    /// Drops cached pipelines and releases their components.
    pub fn clear_cache(&self) {
        for entry in self.cache.iter() {
            self.registry.release(entry.value().scope());
        }
        self.cache.clear();
    }

    fn cached(&self, name: &str) -> Result<Arc<ResolvedPipeline>, ChainflowError> {
        if let Some(resolved) = self.cache.get(name) {
            return Ok(Arc::clone(resolved.value()));
        }

        let built = Arc::new(self.build(name)?);
        match self.cache.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                // Another caller won the race; drop our singletons.
                self.registry.release(built.scope());
                Ok(Arc::clone(existing.get()))
            }
            Entry::Vacant(slot) => {
                debug!(pipeline = %name, "Cached resolved pipeline");
                Ok(Arc::clone(slot.insert(built).value()))
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pipelines", &self.document.pipeline_names().collect::<Vec<_>>())
            .field("factories", &self.factories)
            .field("settings", &self.settings)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
