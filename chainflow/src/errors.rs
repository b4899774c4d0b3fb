//! Error types for the chainflow engine.
//!
//! Errors are split by the phase that raises them. Configuration, planning,
//! conversion and construction errors abort a pipeline build. Render and
//! execution errors abort only the invocation that raised them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for chainflow operations.
#[derive(Debug, Error)]
pub enum ChainflowError {
    /// The configuration document is invalid or could not be read.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The execution path could not be planned.
    #[error("{0}")]
    Plan(#[from] PlanError),

    /// A converter rule could not be resolved.
    #[error("{0}")]
    Conversion(#[from] ConversionError),

    /// A component could not be constructed.
    #[error("{0}")]
    Construction(#[from] ConstructionError),

    /// A pipeline invocation failed.
    #[error("{0}")]
    Execution(#[from] ExecutionError),
}

impl ChainflowError {
    /// Returns true when the error comes from a misconfigured pipeline rather
    /// than from a failed invocation.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, Self::Execution(_))
    }

    /// Returns structured diagnostics for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        match self {
            Self::Config(e) => e.error_info(),
            Self::Plan(e) => e.error_info(),
            Self::Conversion(e) => e.error_info(),
            Self::Construction(e) => e.error_info(),
            Self::Execution(e) => e.error_info(),
        }
    }
}

/// Diagnostics attached to an error: a stable code, a summary and a hint.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "PLAN-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info, attaching the default hint for the code.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        let code = code.into();
        let fix_hint = ErrorSuggestions::get(&code).map(String::from);
        Self {
            code,
            summary: summary.into(),
            fix_hint,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while loading or validating a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration '{}': {source}", path.display())]
    Io {
        /// The file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML for the expected schema.
    #[error("Invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The document is not valid JSON for the expected schema.
    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// The file extension does not name a supported format.
    #[error("Unsupported configuration format for '{}'", path.display())]
    UnsupportedFormat {
        /// The file path.
        path: PathBuf,
    },

    /// Two components in one pipeline share an identity.
    #[error("Pipeline '{pipeline}' declares component '{component}' more than once")]
    DuplicateComponent {
        /// The pipeline name.
        pipeline: String,
        /// The duplicated identity.
        component: String,
    },

    /// No pipeline with this name exists in the document.
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    /// No app with this name exists in the document.
    #[error("Unknown app: {0}")]
    UnknownApp(String),
}

impl ConfigError {
    /// Returns structured diagnostics for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let code = match self {
            Self::Io { .. } => "CONFIG-IO",
            Self::Yaml(_) | Self::Json(_) => "CONFIG-PARSE",
            Self::UnsupportedFormat { .. } => "CONFIG-FORMAT",
            Self::DuplicateComponent { .. } => "CONFIG-DUPLICATE",
            Self::UnknownPipeline(_) => "CONFIG-UNKNOWN-PIPELINE",
            Self::UnknownApp(_) => "CONFIG-UNKNOWN-APP",
        };
        ErrorInfo::new(code, self.to_string())
    }
}

/// Errors raised while planning an execution path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    /// The execution path contains no tokens.
    #[error("Pipeline '{pipeline}' has an empty execution path")]
    EmptyPath {
        /// The pipeline name.
        pipeline: String,
    },

    /// A path token matches neither a converter target nor a component.
    #[error("Pipeline '{pipeline}': path token '{token}' matches neither a converter nor a component")]
    UnresolvedToken {
        /// The pipeline name.
        pipeline: String,
        /// The offending token.
        token: String,
    },

    /// Stage or converter dependencies form a cycle.
    #[error("Pipeline '{pipeline}': cycle detected: {}", cycle.join(" -> "))]
    CycleDetected {
        /// The pipeline name.
        pipeline: String,
        /// The names forming the cycle, first name repeated at the end.
        cycle: Vec<String>,
    },
}

impl PlanError {
    /// Returns structured diagnostics for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        match self {
            Self::EmptyPath { pipeline } => {
                ErrorInfo::new("PLAN-EMPTY", self.to_string()).with_context_entry("pipeline", pipeline)
            }
            Self::UnresolvedToken { pipeline, token } => ErrorInfo::new("PLAN-UNRESOLVED", self.to_string())
                .with_context_entry("pipeline", pipeline)
                .with_context_entry("token", token),
            Self::CycleDetected { pipeline, cycle } => ErrorInfo::new("PLAN-CYCLE", self.to_string())
                .with_context_entry("pipeline", pipeline)
                .with_context_entry("cycle", cycle.join(" -> ")),
        }
    }
}

/// Errors raised while resolving converter rules.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    /// A source names no component and no earlier converter.
    #[error("Converter '{converter}' references unknown source '{source_name}'")]
    UnknownSource {
        /// The converter target name.
        converter: String,
        /// The unknown source.
        source_name: String,
    },

    /// An `instance` rule names more (or fewer) than one source.
    #[error("Instance converter '{converter}' must name exactly one source, got [{}]", sources.join(", "))]
    AmbiguousInstanceTarget {
        /// The converter target name.
        converter: String,
        /// The declared sources.
        sources: Vec<String>,
    },

    /// A `list` rule names an `instance` rule as a source.
    #[error("List converter '{converter}' cannot aggregate instance converter '{source_name}'")]
    MixedSemantics {
        /// The converter target name.
        converter: String,
        /// The instance-typed source.
        source_name: String,
    },

    /// Two rules declare the same target name.
    #[error("Converter target '{converter}' is declared more than once")]
    DuplicateTarget {
        /// The converter target name.
        converter: String,
    },
}

impl ConversionError {
    /// Returns structured diagnostics for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let (code, converter) = match self {
            Self::UnknownSource { converter, .. } => ("CONVERT-UNKNOWN-SOURCE", converter),
            Self::AmbiguousInstanceTarget { converter, .. } => ("CONVERT-AMBIGUOUS-INSTANCE", converter),
            Self::MixedSemantics { converter, .. } => ("CONVERT-MIXED", converter),
            Self::DuplicateTarget { converter } => ("CONVERT-DUPLICATE", converter),
        };
        ErrorInfo::new(code, self.to_string()).with_context_entry("converter", converter)
    }
}

/// Errors raised while constructing a component.
#[derive(Debug, Error)]
pub enum ConstructionError {
    /// No factory is registered for the component type.
    #[error("No factory registered for component '{component}' (type '{kind}')")]
    NoFactory {
        /// The component identity.
        component: String,
        /// The component type name.
        kind: String,
    },

    /// The factory rejected the parameters or failed to connect.
    #[error("Failed to construct component '{component}': {cause}")]
    Failed {
        /// The component identity.
        component: String,
        /// The underlying cause.
        #[source]
        cause: anyhow::Error,
    },
}

impl ConstructionError {
    /// Returns the identity of the component that failed.
    #[must_use]
    pub fn component(&self) -> &str {
        match self {
            Self::NoFactory { component, .. } | Self::Failed { component, .. } => component,
        }
    }

    /// Returns structured diagnostics for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let code = match self {
            Self::NoFactory { .. } => "BUILD-NO-FACTORY",
            Self::Failed { .. } => "BUILD-FAILED",
        };
        ErrorInfo::new(code, self.to_string()).with_context_entry("component", self.component())
    }
}

/// Errors raised while rendering parameter templates.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// A placeholder has no matching runtime binding.
    #[error("Missing binding for placeholder '{name}' at '{path}'")]
    MissingBinding {
        /// The placeholder name.
        name: String,
        /// Location of the placeholder in the parameter tree.
        path: String,
    },
}

/// A failure reported by a component invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ComponentError {
    /// The error message.
    pub message: String,
    /// Whether retrying the invocation may succeed (network, timeout).
    pub transient: bool,
}

impl ComponentError {
    /// Creates a transient (retryable) error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a permanent error that is never retried.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    /// Creates the transient error used when a stage exceeds its timeout.
    #[must_use]
    pub fn timed_out(timeout_ms: u64) -> Self {
        Self::transient(format!("invocation timed out after {timeout_ms}ms"))
    }

    /// Returns whether the error is retryable.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Errors raised while running a resolved pipeline.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A stage failed and its retry budget is spent (or the failure was permanent).
    #[error("Stage '{stage}' failed after {attempts} attempt(s): {cause}")]
    StageFailed {
        /// The failing stage.
        stage: String,
        /// Number of invocations made.
        attempts: usize,
        /// The last failure.
        #[source]
        cause: ComponentError,
    },

    /// The run was cancelled through its cancellation token.
    #[error("Pipeline cancelled: {reason}")]
    Cancelled {
        /// The stage in flight when cancellation was observed, if any.
        stage: Option<String>,
        /// The cancellation reason.
        reason: String,
    },

    /// A stage's parameters could not be rendered.
    #[error("Stage '{stage}': {source}")]
    Render {
        /// The stage whose parameters failed to render.
        stage: String,
        /// The render failure.
        #[source]
        source: RenderError,
    },

    /// A converter value could not be produced at run time.
    #[error("Converter '{converter}' could not be materialized: {reason}")]
    Materialize {
        /// The converter target name.
        converter: String,
        /// Why materialization failed.
        reason: String,
    },
}

impl ExecutionError {
    /// Returns the stage or converter the error is attributed to.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageFailed { stage, .. } | Self::Render { stage, .. } => Some(stage),
            Self::Cancelled { stage, .. } => stage.as_deref(),
            Self::Materialize { converter, .. } => Some(converter),
        }
    }

    /// Returns structured diagnostics for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let code = match self {
            Self::StageFailed { .. } => "RUN-STAGE-FAILED",
            Self::Cancelled { .. } => "RUN-CANCELLED",
            Self::Render { .. } => "RUN-RENDER",
            Self::Materialize { .. } => "RUN-MATERIALIZE",
        };
        let info = ErrorInfo::new(code, self.to_string());
        match self.stage() {
            Some(stage) => info.with_context_entry("stage", stage),
            None => info,
        }
    }
}

/// Provides default suggestions for error codes.
pub struct ErrorSuggestions;

impl ErrorSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "PLAN-EMPTY" => Some("Set `excute_path` to at least one component or converter name."),
            "PLAN-UNRESOLVED" => Some(
                "Every path token must match a converter `name` or a component `name`/`alias`. \
                 Check for typos.",
            ),
            "PLAN-CYCLE" => Some(
                "Remove the repeated stage or the converter source that loops back. \
                 Paths are linear chains with converter fan-in.",
            ),
            "CONVERT-UNKNOWN-SOURCE" => Some(
                "Converter sources must name a component in this pipeline or a converter declared earlier.",
            ),
            "CONVERT-AMBIGUOUS-INSTANCE" => Some("An instance converter takes exactly one component as its value."),
            "CONVERT-MIXED" => Some("Use the instance converter directly instead of listing it."),
            "BUILD-NO-FACTORY" => Some("Register a factory for the component type before building."),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "my_stage");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.summary, "Test error");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"my_stage".to_string()));
    }

    #[test]
    fn test_error_info_default_hint() {
        let info = ErrorInfo::new("PLAN-CYCLE", "cycle");
        assert!(info.fix_hint.is_some());
    }

    #[test]
    fn test_cycle_error_display() {
        let err = PlanError::CycleDetected {
            pipeline: "p".to_string(),
            cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };

        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.error_info().code, "PLAN-CYCLE");
    }

    #[test]
    fn test_configuration_errors_are_distinguished() {
        let plan: ChainflowError = PlanError::EmptyPath {
            pipeline: "p".to_string(),
        }
        .into();
        assert!(plan.is_configuration_error());

        let run: ChainflowError = ExecutionError::StageFailed {
            stage: "model".to_string(),
            attempts: 3,
            cause: ComponentError::transient("connection reset"),
        }
        .into();
        assert!(!run.is_configuration_error());
        assert_eq!(run.error_info().context.get("stage"), Some(&"model".to_string()));
    }

    #[test]
    fn test_construction_error_keeps_cause() {
        let err = ConstructionError::Failed {
            component: "OpenAiStyleModel".to_string(),
            cause: anyhow::anyhow!("api_key is required"),
        };

        assert_eq!(err.component(), "OpenAiStyleModel");
        assert!(err.to_string().contains("api_key is required"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_component_error_kinds() {
        assert!(ComponentError::transient("x").is_transient());
        assert!(!ComponentError::permanent("x").is_transient());
        assert!(ComponentError::timed_out(50).message.contains("50ms"));
    }

    #[test]
    fn test_suggestions() {
        assert!(ErrorSuggestions::get("PLAN-UNRESOLVED").is_some());
        assert!(ErrorSuggestions::get("UNKNOWN").is_none());
    }
}
