//! Graph construction, scheduling and retry.

mod graph;
mod node;
mod report;
mod retry;
mod scheduler;


pub use graph::{EdgeKind, ExecutionGraph};
pub use node::{ExecutionNode, FailureKind, NodeStatus, SkipReason};
pub use report::{NodeReport, PipelineReport};
pub use retry::{Clock, RetryEngine, RetryEvent, RetryOutcome, TokioClock};
pub use scheduler::Orchestrator;
