//! Runtime node state.

use crate::config::InstanceId;
use crate::errors::StateError;
use crate::handler::HandlerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Runtime status of an execution node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for predecessors or a concurrency slot.
    Pending,
    /// Dispatched; an attempt is in progress.
    Running,
    /// Waiting out a backoff delay before the next attempt.
    Retrying,
    /// Outputs stored.
    Succeeded,
    /// Gave up.
    Failed,
    /// Never dispatched.
    Skipped,
}

impl NodeStatus {
    /// Returns true for statuses that never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Returns true for `Running` and `Retrying`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Retrying)
    }

    fn can_transition_to(self, next: Self) -> bool {
        use NodeStatus::{Failed, Pending, Retrying, Running, Skipped, Succeeded};
        matches!(
            (self, next),
            (Pending, Running | Failed | Skipped)
                | (Running, Retrying | Succeeded | Failed)
                | (Retrying, Running | Failed)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Why a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// `execute` failed with a non-retryable error or ran out of attempts.
    Execution,
    /// Its configuration could not be resolved.
    Reference,
    /// Its sandbox could not be set up.
    Isolation,
    /// `initialize` rejected the configuration.
    Initialization,
    /// Force-terminated after cancellation.
    Cancelled,
    /// The last attempt timed out.
    Timeout,
    /// The orchestrator could not record the result.
    Internal,
}

/// Why a node was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A transitive predecessor failed.
    UpstreamFailed,
    /// A failure with pipeline blast radius stopped dispatch.
    Aborted,
    /// The run was cancelled before the node started.
    Cancelled,
}

/// One scheduled instance and its runtime bookkeeping.
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    /// Qualified id.
    pub id: InstanceId,
    /// Declaration position.
    pub index: usize,
    status: NodeStatus,
    /// Attempts started so far.
    pub attempts: u32,
    /// Configuration after token substitution, once dispatched.
    pub resolved_config: Option<Value>,
    /// The most recent error message.
    pub last_error: Option<String>,
    /// Set when the node failed.
    pub failure: Option<FailureKind>,
    /// Set when the node was skipped.
    pub skip_reason: Option<SkipReason>,
    /// Cleanup or teardown error, if any.
    pub cleanup_error: Option<String>,
    /// Final handler lifecycle state, once known.
    pub handler_state: Option<HandlerState>,
    /// Dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the node reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionNode {
    /// Creates a pending node.
    #[must_use]
    pub fn new(id: InstanceId, index: usize) -> Self {
        Self {
            id,
            index,
            status: NodeStatus::Pending,
            attempts: 0,
            resolved_config: None,
            last_error: None,
            failure: None,
            skip_reason: None,
            cleanup_error: None,
            handler_state: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Moves to `next` or fails with a [`StateError`].
    pub fn transition(&mut self, next: NodeStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::new(format!("illegal node transition {} -> {next}", self.status))
                .with_instance(self.id.to_string()));
        }
        match next {
            NodeStatus::Running if self.started_at.is_none() => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Marks the node failed.
    pub fn fail(&mut self, kind: FailureKind, error: impl Into<String>) -> Result<(), StateError> {
        self.transition(NodeStatus::Failed)?;
        self.failure = Some(kind);
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Marks the node skipped.
    pub fn skip(&mut self, reason: SkipReason) -> Result<(), StateError> {
        self.transition(NodeStatus::Skipped)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    /// Milliseconds between dispatch and completion.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ExecutionNode {
        ExecutionNode::new(InstanceId::new("shell", "a"), 0)
    }

    #[test]
    fn test_retry_cycle() {
        let mut n = node();
        n.transition(NodeStatus::Running).unwrap();
        n.transition(NodeStatus::Retrying).unwrap();
        n.transition(NodeStatus::Running).unwrap();
        n.transition(NodeStatus::Succeeded).unwrap();
        assert!(n.status().is_terminal());
        assert!(n.duration_ms().is_some());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut n = node();
        n.transition(NodeStatus::Running).unwrap();
        n.transition(NodeStatus::Succeeded).unwrap();
        let err = n.transition(NodeStatus::Running).unwrap_err();
        assert_eq!(err.instance.as_deref(), Some("shell.a"));
    }

    #[test]
    fn test_skip_only_from_pending() {
        let mut n = node();
        n.transition(NodeStatus::Running).unwrap();
        assert!(n.skip(SkipReason::UpstreamFailed).is_err());

        let mut p = node();
        p.skip(SkipReason::UpstreamFailed).unwrap();
        assert_eq!(p.skip_reason, Some(SkipReason::UpstreamFailed));
    }

    #[test]
    fn test_reference_failure_before_dispatch() {
        let mut n = node();
        n.fail(FailureKind::Reference, "unresolved").unwrap();
        assert_eq!(n.status(), NodeStatus::Failed);
        assert_eq!(n.failure, Some(FailureKind::Reference));
        assert_eq!(n.duration_ms(), None);
    }
}
