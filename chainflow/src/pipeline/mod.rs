//! Pipeline building and execution.
//!
//! This module provides:
//! - Execution path planning
//! - Converter resolution
//! - The builder turning a definition into a [`ResolvedPipeline`]
//! - The wave executor with retry, timeout and cancellation

mod builder;
mod converter;
mod executor;
pub mod planner;
mod resolved;
pub mod retry;

#[cfg(test)]
mod integration_tests;

pub use builder::{BuildContext, PipelineBuilder};
pub use converter::{resolve as resolve_converters, ListEntry, ResolvedConverter, ResolvedConverters, ResolvedValue};
pub use executor::{run, RunReport, StageReport};
pub use planner::{plan, ExecutionPlan, NodeKind, PlanNode};
pub use resolved::{
    BoundComponent, BoundStage, ExecutionPlanNode, InputBinding, Instantiation, ResolvedPipeline,
};
pub use retry::{
    should_retry, with_retry, Attempted, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision,
    RetryError, RetryState,
};
