//! Testing utilities for chainflow pipelines.
//!
//! This module provides:
//! - Mock components that record, fail, stall or build prompts
//! - Factory helpers for wiring mocks into a [`FactoryRegistry`](crate::components::FactoryRegistry)

mod mocks;

pub use mocks::{
    recording_factory, register_prompt_factories, shared_factory, FailingComponent, FlakyComponent,
    PromptComponent, RecordedCall, RecordingComponent, SlowComponent,
};
