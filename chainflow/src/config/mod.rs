//! Configuration types and loading.
//!
//! A configuration document maps pipeline names to [`PipelineSpec`]s. An
//! optional app document composes several pipelines into an [`AppSpec`].

mod app;
mod document;
mod settings;
mod spec;

pub use app::{AgentInfo, AppSpec, DEFAULT_RUN_ORDER};
pub use document::ConfigDocument;
pub use settings::EngineSettings;
pub use spec::{ComponentSpec, ConverterKind, ConverterRule, ParamMap, PipelineSpec};
