//! # Chainflow
//!
//! A configuration-driven component graph resolution and execution engine.
//!
//! A configuration document names pipelines. Each pipeline has an execution
//! path (`excute_path`, stage names joined by `-`), converter rules that
//! aggregate (`list`), share (`instance`) or fix (`str`) values between
//! stages, and the components it wires together with their parameters.
//! Chainflow turns such a definition into a runnable pipeline:
//!
//! - **Planning**: the path is parsed, validated and ordered topologically
//! - **Converter resolution**: list entries, shared references and literals
//!   are bound once per build
//! - **Construction**: components come from factories registered by name;
//!   components shared through `instance` converters are built once per scope
//! - **Execution**: stages run in waves with template rendering, per-stage
//!   retry, timeouts, cancellation and lifecycle events
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chainflow::prelude::*;
//!
//! register_factory("OpenAiStyleModel", |args: &ComponentArgs| {
//!     Ok(Arc::new(MyModel::new(args)?) as ComponentHandle)
//! });
//!
//! let engine = Engine::new(ConfigDocument::from_path("pipelines.yaml")?);
//! let report = engine
//!     .execute("test01", &Bindings::new().with("query", json!("Summarize X")))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod components;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod template;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::components::{
        register_factory, BuildScope, Component, ComponentArgs, ComponentHandle, ComponentRegistry,
        FactoryRegistry, StageCall,
    };
    pub use crate::config::{
        AgentInfo, AppSpec, ComponentSpec, ConfigDocument, ConverterKind, ConverterRule, EngineSettings,
        PipelineSpec,
    };
    pub use crate::engine::{AppReport, Engine};
    pub use crate::errors::{
        ChainflowError, ComponentError, ConfigError, ConstructionError, ConversionError, ErrorInfo,
        ExecutionError, PlanError, RenderError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{PipelineBuilder, ResolvedPipeline, RunReport};
    pub use crate::template::Bindings;
}
