//! Orchestration events.
//!
//! The scheduler reports progress through an [`EventSink`]. Event names are
//! listed here so sinks and tests can match on them.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run began.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// A run finished, successfully or not.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
/// An external cancellation was observed.
pub const PIPELINE_CANCELLED: &str = "pipeline.cancelled";
/// A node was dispatched.
pub const NODE_STARTED: &str = "node.started";
/// A node failed an attempt and will be retried.
pub const NODE_RETRYING: &str = "node.retrying";
/// A node succeeded and its outputs were stored.
pub const NODE_SUCCEEDED: &str = "node.succeeded";
/// A node failed.
pub const NODE_FAILED: &str = "node.failed";
/// A node was skipped.
pub const NODE_SKIPPED: &str = "node.skipped";
/// A node's cleanup or sandbox teardown failed.
pub const NODE_CLEANUP_FAILED: &str = "node.cleanup_failed";
