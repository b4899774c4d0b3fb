//! Pipeline execution.
//!
//! Stages run wave by wave: a wave holds stages whose inputs are all
//! available, and its stages run concurrently. A linear path therefore runs
//! strictly in order. The first failure aborts the run and discards partial
//! results; the resolved pipeline stays usable.

use super::resolved::{BoundComponent, ExecutionPlanNode, InputBinding, ResolvedPipeline};
use super::retry::{with_retry, Attempted, RetryError};
use crate::cancellation::CancellationToken;
use crate::components::{ComponentHandle, StageCall};
use crate::errors::{ComponentError, ExecutionError};
use crate::events::{self, EventSink};
use crate::template::{self, Bindings};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Timing and attempt counts for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// The stage name.
    pub name: String,
    /// Invocations made, including retries.
    pub attempts: usize,
    /// Wall time including retries and backoff.
    pub duration_ms: u64,
}

/// The result of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// The pipeline that ran.
    pub pipeline: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// The terminal output: the single terminal stage's value, or an object
    /// keyed by terminal stage when the last segment has several members.
    pub output: Value,
    /// Every stage's output, by stage name.
    pub outputs: BTreeMap<String, Value>,
    /// Per-stage reports in completion order.
    pub stages: Vec<StageReport>,
    /// Total wall time.
    pub duration_ms: u64,
}

impl RunReport {
    /// Finds the report of a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
enum NodeOutput {
    Value(Value),
    Instance(ComponentHandle),
}

impl NodeOutput {
    fn to_value(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Instance(handle) => json!({ "instance": handle.name() }),
        }
    }
}

type Outputs = HashMap<String, NodeOutput>;

/// Runs a resolved pipeline once.
///
/// # Errors
///
/// Returns [`ExecutionError::StageFailed`] when a stage fails permanently or
/// spends its retry budget, [`ExecutionError::Render`] for unbound
/// placeholders, and [`ExecutionError::Cancelled`] when `cancel` fires.
pub async fn run(
    pipeline: &ResolvedPipeline,
    bindings: &Bindings,
    cancel: &CancellationToken,
    sink: &dyn EventSink,
) -> Result<RunReport, ExecutionError> {
    let run = Run {
        pipeline,
        bindings,
        cancel,
        sink,
        run_id: Uuid::new_v4(),
    };
    let started_at = Utc::now();
    let clock = Instant::now();

    info!(pipeline = %pipeline.name(), run_id = %run.run_id, "Pipeline started");
    sink.emit(events::PIPELINE_STARTED, Some(run.event_data(json!({})))).await;

    match run.run_waves().await {
        Ok((outputs, stages)) => {
            let output = match pipeline.terminals() {
                [single] => outputs.get(single).map_or(Value::Null, NodeOutput::to_value),
                many => Value::Object(
                    many.iter()
                        .map(|t| (t.clone(), outputs.get(t).map_or(Value::Null, NodeOutput::to_value)))
                        .collect(),
                ),
            };
            let duration_ms = elapsed_ms(clock);

            info!(pipeline = %pipeline.name(), run_id = %run.run_id, duration_ms, "Pipeline completed");
            sink.emit(
                events::PIPELINE_COMPLETED,
                Some(run.event_data(json!({ "duration_ms": duration_ms }))),
            )
            .await;

            Ok(RunReport {
                run_id: run.run_id,
                pipeline: pipeline.name().to_string(),
                started_at,
                output,
                outputs: outputs.iter().map(|(k, v)| (k.clone(), v.to_value())).collect(),
                stages,
                duration_ms,
            })
        }
        Err(err) => {
            let data = run.event_data(json!({
                "stage": err.stage(),
                "error": err.to_string(),
            }));
            if let ExecutionError::Cancelled { reason, .. } = &err {
                warn!(pipeline = %pipeline.name(), run_id = %run.run_id, reason = %reason, "Pipeline cancelled");
                sink.emit(events::PIPELINE_CANCELLED, Some(data)).await;
            } else {
                error!(pipeline = %pipeline.name(), run_id = %run.run_id, error = %err, "Pipeline failed");
                sink.emit(events::PIPELINE_FAILED, Some(data)).await;
            }
            Err(err)
        }
    }
}

struct Run<'a> {
    pipeline: &'a ResolvedPipeline,
    bindings: &'a Bindings,
    cancel: &'a CancellationToken,
    sink: &'a dyn EventSink,
    run_id: Uuid,
}

impl Run<'_> {
    fn event_data(&self, extra: Value) -> Value {
        let mut data = json!({
            "pipeline": self.pipeline.name(),
            "run_id": self.run_id.to_string(),
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut data, extra) {
            base.extend(extra);
        }
        data
    }

    async fn run_waves(&self) -> Result<(Outputs, Vec<StageReport>), ExecutionError> {
        let mut outputs = Outputs::new();
        let mut stages = Vec::new();

        for wave in self.pipeline.waves() {
            if self.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled {
                    stage: None,
                    reason: self.cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
                });
            }

            // The first failure drops the rest of the wave.
            let results = try_join_all(wave.iter().map(|node| self.run_node(node, &outputs))).await?;
            for (node, (output, report)) in wave.iter().zip(results) {
                outputs.insert(node.stage_name.clone(), output);
                stages.push(report);
            }
        }

        Ok((outputs, stages))
    }

    async fn run_node(
        &self,
        node: &ExecutionPlanNode,
        outputs: &Outputs,
    ) -> Result<(NodeOutput, StageReport), ExecutionError> {
        let stage = node.stage_name.as_str();
        let clock = Instant::now();
        debug!(pipeline = %self.pipeline.name(), stage = %stage, "Stage started");
        self.sink
            .emit(events::STAGE_STARTED, Some(self.event_data(json!({ "stage": stage }))))
            .await;

        let result = match node.component() {
            Some(component) => self.run_component(node, component, outputs).await,
            None => self.run_converter(stage, outputs).map(|output| Attempted { value: output, attempts: 1 }),
        };

        match result {
            Ok(Attempted { value, attempts }) => {
                let duration_ms = elapsed_ms(clock);
                self.sink
                    .emit(
                        events::STAGE_COMPLETED,
                        Some(self.event_data(json!({
                            "stage": stage,
                            "attempts": attempts,
                            "duration_ms": duration_ms,
                        }))),
                    )
                    .await;
                Ok((
                    value,
                    StageReport {
                        name: stage.to_string(),
                        attempts,
                        duration_ms,
                    },
                ))
            }
            Err(err) => {
                if !matches!(err, ExecutionError::Cancelled { .. }) {
                    error!(pipeline = %self.pipeline.name(), stage = %stage, error = %err, "Stage failed");
                    self.sink
                        .emit(
                            events::STAGE_FAILED,
                            Some(self.event_data(json!({ "stage": stage, "error": err.to_string() }))),
                        )
                        .await;
                }
                Err(err)
            }
        }
    }

    fn run_converter(&self, target: &str, outputs: &Outputs) -> Result<NodeOutput, ExecutionError> {
        let converters = self.pipeline.converters();
        if let Some(handle) = converters.instance(target) {
            return Ok(NodeOutput::Instance(Arc::clone(handle)));
        }
        converters
            .materialize(target, self.bindings, &|stage: &str| stage_value(outputs, stage))
            .map(NodeOutput::Value)
    }

    async fn run_component(
        &self,
        node: &ExecutionPlanNode,
        component: &BoundComponent,
        outputs: &Outputs,
    ) -> Result<Attempted<NodeOutput>, ExecutionError> {
        let stage = node.stage_name.as_str();
        let call = self.prepare_call(node, component, outputs)?;
        let config = self.pipeline.settings().retry_config(component.max_retry);

        let outcome = with_retry(
            &config,
            stage,
            self.cancel,
            |attempt| {
                debug!(stage = %stage, attempt, "Invoking component");
                invoke_once(&component.handle, &call, component.timeout_ms)
            },
            ComponentError::is_transient,
            |retry, delay, err| {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                warn!(stage = %stage, retry, delay_ms, error = %err, "Retrying stage");
                self.sink.try_emit(
                    events::STAGE_RETRYING,
                    Some(self.event_data(json!({
                        "stage": stage,
                        "retry": retry,
                        "delay_ms": delay_ms,
                        "error": err.message,
                    }))),
                );
            },
        )
        .await;

        match outcome {
            Ok(Attempted { value, attempts }) => Ok(Attempted {
                value: NodeOutput::Value(value),
                attempts,
            }),
            Err(
                RetryError::Exhausted { attempts, last: cause }
                | RetryError::NotRetryable { attempts, error: cause },
            ) => Err(ExecutionError::StageFailed {
                stage: stage.to_string(),
                attempts,
                cause,
            }),
            Err(RetryError::Cancelled { reason, .. }) => Err(ExecutionError::Cancelled {
                stage: Some(stage.to_string()),
                reason,
            }),
        }
    }

    /// Renders literal params, then injects converter values and upstream
    /// outputs. Converter values win over literal params of the same key.
    fn prepare_call(
        &self,
        node: &ExecutionPlanNode,
        component: &BoundComponent,
        outputs: &Outputs,
    ) -> Result<StageCall, ExecutionError> {
        let stage = node.stage_name.as_str();
        let converters = self.pipeline.converters();

        let mut literal = component.params.clone();
        for binding in &node.input_bindings {
            if let InputBinding::Param { param, .. } = binding {
                literal.remove(param);
            }
        }
        let params = template::render_params(&literal, self.bindings).map_err(|source| ExecutionError::Render {
            stage: stage.to_string(),
            source,
        })?;

        let mut call = StageCall::new(stage).with_params(params);
        call.bindings = self.bindings.clone();

        for binding in &node.input_bindings {
            match binding {
                InputBinding::Predecessor(name) => match outputs.get(name) {
                    Some(NodeOutput::Value(value)) => {
                        call.inputs.insert(name.clone(), value.clone());
                    }
                    Some(NodeOutput::Instance(handle)) => {
                        call.instances.insert(name.clone(), Arc::clone(handle));
                    }
                    None => {
                        return Err(ExecutionError::Materialize {
                            converter: name.clone(),
                            reason: format!("no output available for stage '{stage}'"),
                        })
                    }
                },
                InputBinding::Param { param, target } => {
                    if let Some(handle) = converters.instance(target) {
                        call.instances.insert(param.clone(), Arc::clone(handle));
                    } else {
                        let value = converters.materialize(target, self.bindings, &|s: &str| stage_value(outputs, s))?;
                        call.params.insert(param.clone(), value);
                    }
                }
            }
        }

        if node.predecessors().count() == 1 && call.inputs.len() == 1 {
            call.input = call.inputs.values().next().cloned();
        }

        Ok(call)
    }
}

async fn invoke_once(
    handle: &ComponentHandle,
    call: &StageCall,
    timeout_ms: Option<u64>,
) -> Result<Value, ComponentError> {
    match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), handle.invoke(call))
            .await
            .unwrap_or_else(|_| Err(ComponentError::timed_out(ms))),
        None => handle.invoke(call).await,
    }
}

fn stage_value(outputs: &Outputs, stage: &str) -> Option<Value> {
    match outputs.get(stage)? {
        NodeOutput::Value(value) => Some(value.clone()),
        NodeOutput::Instance(_) => None,
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}
