//! Pipeline lifecycle events.
//!
//! The executor reports run and stage boundaries to an [`EventSink`]. Event
//! data is a JSON object carrying at least `pipeline` and `run_id`.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run started.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// A run produced its output.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
/// A run failed.
pub const PIPELINE_FAILED: &str = "pipeline.failed";
/// A run was cancelled.
pub const PIPELINE_CANCELLED: &str = "pipeline.cancelled";
/// A stage started.
pub const STAGE_STARTED: &str = "stage.started";
/// A stage failed transiently and will be retried.
pub const STAGE_RETRYING: &str = "stage.retrying";
/// A stage produced its output.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A stage failed for good.
pub const STAGE_FAILED: &str = "stage.failed";
