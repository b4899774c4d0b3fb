//! Converter resolution.
//!
//! Converters are resolved in declaration order, so a `list` rule may
//! aggregate an earlier `list` or `str` rule. `instance` rules resolve to the
//! shared singleton of their source within the current build scope.

use super::builder::BuildContext;
use super::planner::{ExecutionPlan, NodeKind};
use crate::components::{ComponentArgs, ComponentHandle};
use crate::config::{ComponentSpec, ConverterKind, ConverterRule, ParamMap, PipelineSpec};
use crate::errors::{ChainflowError, ConversionError, ExecutionError};
use crate::template::{self, Bindings};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// One element of a `list` converter.
#[derive(Debug, Clone)]
pub enum ListEntry {
    /// The run-time output of a stage on the execution path.
    Stage(String),
    /// The value of an earlier `list` or `str` converter.
    Converter(String),
    /// A component off the path, contributing its rendered parameter payload.
    Component {
        /// The component identity.
        identity: String,
        /// The instance whose `as_parameter` shapes the payload.
        handle: ComponentHandle,
        /// Literal parameters, rendered at run time.
        params: ParamMap,
    },
}

/// The resolved value of a converter.
#[derive(Debug, Clone)]
pub enum ResolvedValue {
    /// Ordered entries, materialized at run time.
    List(Vec<ListEntry>),
    /// A shared component reference.
    Instance {
        /// The source component identity.
        source: String,
        /// The shared instance.
        handle: ComponentHandle,
    },
    /// A literal string.
    Literal(String),
}

/// A converter with its resolved value.
#[derive(Debug, Clone)]
pub struct ResolvedConverter {
    /// The converter target name.
    pub target: String,
    /// The resolved value.
    pub value: ResolvedValue,
}

impl ResolvedConverter {
    /// The conversion semantics of the rule this came from.
    #[must_use]
    pub fn kind(&self) -> ConverterKind {
        match self.value {
            ResolvedValue::List(_) => ConverterKind::List,
            ResolvedValue::Instance { .. } => ConverterKind::Instance,
            ResolvedValue::Literal(_) => ConverterKind::Literal,
        }
    }
}

/// All resolved converters of a pipeline, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConverters {
    converters: Vec<ResolvedConverter>,
}

impl ResolvedConverters {
    /// Finds a converter by target name, ignoring ASCII case.
    #[must_use]
    pub fn get(&self, target: &str) -> Option<&ResolvedConverter> {
        self.converters.iter().find(|c| c.target.eq_ignore_ascii_case(target))
    }

    /// Gets the shared instance of an `instance` converter.
    #[must_use]
    pub fn instance(&self, target: &str) -> Option<&ComponentHandle> {
        match &self.get(target)?.value {
            ResolvedValue::Instance { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// Iterates in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedConverter> {
        self.converters.iter()
    }

    /// Number of converters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.converters.len()
    }

    /// Returns true if there are no converters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Produces the run-time value of a `list` or `str` converter.
    ///
    /// `stage_output` returns the output of a completed stage.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Render`] if a component entry's parameters
    /// cannot be rendered and [`ExecutionError::Materialize`] if a stage entry
    /// has no output yet or the converter carries an instance.
    pub fn materialize(
        &self,
        target: &str,
        bindings: &Bindings,
        stage_output: &dyn Fn(&str) -> Option<Value>,
    ) -> Result<Value, ExecutionError> {
        let converter = self.get(target).ok_or_else(|| ExecutionError::Materialize {
            converter: target.to_string(),
            reason: "no such converter".to_string(),
        })?;

        match &converter.value {
            ResolvedValue::Literal(text) => Ok(Value::String(text.clone())),
            ResolvedValue::Instance { .. } => Err(ExecutionError::Materialize {
                converter: converter.target.clone(),
                reason: "instance converters carry a component reference, not a value".to_string(),
            }),
            ResolvedValue::List(entries) => entries
                .iter()
                .map(|entry| match entry {
                    ListEntry::Stage(stage) => stage_output(stage).ok_or_else(|| ExecutionError::Materialize {
                        converter: converter.target.clone(),
                        reason: format!("stage '{stage}' has not produced output"),
                    }),
                    ListEntry::Converter(name) => self.materialize(name, bindings, stage_output),
                    ListEntry::Component {
                        identity,
                        handle,
                        params,
                    } => {
                        let rendered = template::render_params(params, bindings).map_err(|source| {
                            ExecutionError::Render {
                                stage: identity.clone(),
                                source,
                            }
                        })?;
                        Ok(handle.as_parameter(&rendered))
                    }
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }

    fn push(&mut self, converter: ResolvedConverter) {
        self.converters.push(converter);
    }
}

/// Resolves every converter rule of `spec`.
///
/// # Errors
///
/// Returns a [`ConversionError`] for malformed rules and a
/// [`crate::errors::ConstructionError`] if a source component cannot be built.
pub fn resolve(
    spec: &PipelineSpec,
    plan: &ExecutionPlan,
    ctx: &BuildContext<'_>,
) -> Result<ResolvedConverters, ChainflowError> {
    let mut seen = HashSet::new();
    for rule in &spec.converters {
        if !seen.insert(rule.target_name.to_ascii_lowercase()) {
            return Err(ConversionError::DuplicateTarget {
                converter: rule.target_name.clone(),
            }
            .into());
        }
    }

    let mut resolved = ResolvedConverters::default();
    for rule in &spec.converters {
        let value = match rule.kind {
            ConverterKind::Literal => ResolvedValue::Literal(rule.literal_value()),
            ConverterKind::Instance => {
                let [source] = rule.sources.as_slice() else {
                    return Err(ConversionError::AmbiguousInstanceTarget {
                        converter: rule.target_name.clone(),
                        sources: rule.sources.clone(),
                    }
                    .into());
                };
                let component = spec.component(source).ok_or_else(|| unknown_source(rule, source))?;
                ResolvedValue::Instance {
                    source: component.identity().to_string(),
                    handle: ctx.instantiate(component, &resolved)?,
                }
            }
            ConverterKind::List => ResolvedValue::List(
                rule.sources
                    .iter()
                    .map(|source| list_entry(spec, plan, ctx, rule, source, &resolved))
                    .collect::<Result<_, _>>()?,
            ),
        };

        debug!(
            pipeline = %ctx.pipeline,
            converter = %rule.target_name,
            kind = %rule.kind,
            "Resolved converter"
        );
        resolved.push(ResolvedConverter {
            target: rule.target_name.clone(),
            value,
        });
    }

    Ok(resolved)
}

fn list_entry(
    spec: &PipelineSpec,
    plan: &ExecutionPlan,
    ctx: &BuildContext<'_>,
    rule: &ConverterRule,
    source: &str,
    resolved: &ResolvedConverters,
) -> Result<ListEntry, ChainflowError> {
    if let Some(other) = spec.converter(source) {
        if other.kind == ConverterKind::Instance {
            return Err(ConversionError::MixedSemantics {
                converter: rule.target_name.clone(),
                source_name: other.target_name.clone(),
            }
            .into());
        }
        // Only earlier rules are visible.
        return match resolved.get(&other.target_name) {
            Some(earlier) => Ok(ListEntry::Converter(earlier.target.clone())),
            None => Err(unknown_source(rule, source).into()),
        };
    }

    let component = spec.component(source).ok_or_else(|| unknown_source(rule, source))?;
    let identity = component.identity().to_string();

    if plan.node(&identity).is_some_and(|n| n.kind == NodeKind::Component) {
        return Ok(ListEntry::Stage(identity));
    }

    Ok(ListEntry::Component {
        handle: ctx.instantiate(component, resolved)?,
        params: construction_args(component, resolved).params,
        identity,
    })
}

fn unknown_source(rule: &ConverterRule, source: &str) -> ConversionError {
    ConversionError::UnknownSource {
        converter: rule.target_name.clone(),
        source_name: source.to_string(),
    }
}

/// Builds the factory arguments for a component.
///
/// Top-level parameters named like a converter target take that converter's
/// value: `instance` values move into `instances`, `str` values replace the
/// literal. `list` values are injected at run time instead.
pub(crate) fn construction_args(spec: &ComponentSpec, converters: &ResolvedConverters) -> ComponentArgs {
    let mut args = ComponentArgs::new(spec.identity(), spec.name.clone()).with_params(spec.param.clone());

    for key in spec.param.keys() {
        match converters.get(key).map(|c| &c.value) {
            Some(ResolvedValue::Instance { handle, .. }) => {
                args.params.remove(key);
                args.instances.insert(key.clone(), Arc::clone(handle));
            }
            Some(ResolvedValue::Literal(text)) => {
                args.params.insert(key.clone(), Value::String(text.clone()));
            }
            Some(ResolvedValue::List(_)) | None => {}
        }
    }

    args
}
