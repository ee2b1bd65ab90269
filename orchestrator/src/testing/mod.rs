//! Testing utilities for pipelines and task handlers.
//!
//! This module provides:
//! - Scripted mock handlers and a recorder of their lifecycle calls
//! - A clock that records retry backoff instead of sleeping
//! - A pipeline document builder

mod clock;
mod fixtures;
mod mocks;

pub use clock::RecordingClock;
pub use fixtures::PipelineFixture;
pub use mocks::{FailingTask, MockTask, Phase, TaskRecorder};
