//! Run report.

use super::node::{ExecutionNode, FailureKind, NodeStatus, SkipReason};
use crate::config::InstanceId;
use crate::errors::{EXIT_CANCELLED, EXIT_INTERNAL, EXIT_NODE_FAILURE, EXIT_SUCCESS};
use crate::handler::HandlerState;
use crate::state::StateSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Final state of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    /// Qualified id.
    pub id: InstanceId,
    /// Terminal status.
    pub status: NodeStatus,
    /// Attempts made.
    pub attempts: u32,
    /// The most recent error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Failure class, for failed nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Skip reason, for skipped nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Cleanup or teardown error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_error: Option<String>,
    /// Final handler lifecycle state, for dispatched nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_state: Option<HandlerState>,
    /// Dispatch to completion, for dispatched nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl From<&ExecutionNode> for NodeReport {
    fn from(node: &ExecutionNode) -> Self {
        Self {
            id: node.id.clone(),
            status: node.status(),
            attempts: node.attempts,
            last_error: node.last_error.clone(),
            failure: node.failure,
            skip_reason: node.skip_reason,
            cleanup_error: node.cleanup_error.clone(),
            handler_state: node.handler_state,
            duration_ms: node.duration_ms(),
        }
    }
}

/// Everything known about a finished run.
///
/// Produced for every run, including failed, aborted and cancelled ones; the
/// snapshot then holds the partial results.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Unique run id.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: i64,
    /// Nodes in declaration order.
    pub nodes: Vec<NodeReport>,
    /// Stored outputs of every succeeded node.
    pub snapshot: StateSnapshot,
    /// An external cancellation was observed.
    pub cancelled: bool,
    /// A pipeline-wide failure stopped dispatch.
    pub aborted: bool,
    /// Orchestrator bookkeeping errors.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub state_errors: Vec<String>,
}

impl PipelineReport {
    /// Returns the report for a node.
    #[must_use]
    pub fn node(&self, id: &InstanceId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Returns the status of the node `"<type>.<name>"`.
    #[must_use]
    pub fn status_of(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.iter().find(|n| n.id.to_string() == id).map(|n| n.status)
    }

    /// Returns true if every node succeeded and cleaned up.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code() == EXIT_SUCCESS
    }

    /// Ids of nodes with the given status.
    #[must_use]
    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<&InstanceId> {
        self.nodes.iter().filter(|n| n.status == status).map(|n| &n.id).collect()
    }

    /// Process exit code for this run.
    ///
    /// Bookkeeping errors win over cancellation, which wins over node
    /// failures.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if !self.state_errors.is_empty() {
            EXIT_INTERNAL
        } else if self.cancelled {
            EXIT_CANCELLED
        } else if self
            .nodes
            .iter()
            .any(|n| n.status != NodeStatus::Succeeded || n.cleanup_error.is_some())
        {
            EXIT_NODE_FAILURE
        } else {
            EXIT_SUCCESS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(nodes: Vec<NodeReport>) -> PipelineReport {
        PipelineReport {
            run_id: Uuid::now_v7(),
            pipeline: "p".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 0,
            nodes,
            snapshot: StateSnapshot::default(),
            cancelled: false,
            aborted: false,
            state_errors: Vec::new(),
        }
    }

    fn node(name: &str, status: NodeStatus) -> NodeReport {
        let mut node = ExecutionNode::new(InstanceId::new("shell", name), 0);
        match status {
            NodeStatus::Succeeded => {
                node.transition(NodeStatus::Running).unwrap();
                node.transition(NodeStatus::Succeeded).unwrap();
            }
            NodeStatus::Failed => node.fail(FailureKind::Execution, "boom").unwrap(),
            NodeStatus::Skipped => node.skip(SkipReason::UpstreamFailed).unwrap(),
            _ => {}
        }
        NodeReport::from(&node)
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(vec![node("a", NodeStatus::Succeeded)]).exit_code(), EXIT_SUCCESS);
        assert_eq!(report(vec![]).exit_code(), EXIT_SUCCESS);

        let failed = report(vec![node("a", NodeStatus::Succeeded), node("b", NodeStatus::Skipped)]);
        assert_eq!(failed.exit_code(), EXIT_NODE_FAILURE);

        let mut cancelled = failed.clone();
        cancelled.cancelled = true;
        assert_eq!(cancelled.exit_code(), EXIT_CANCELLED);

        cancelled.state_errors.push("duplicate write".to_string());
        assert_eq!(cancelled.exit_code(), EXIT_INTERNAL);
    }

    #[test]
    fn test_cleanup_error_fails_run() {
        let mut ok = node("a", NodeStatus::Succeeded);
        ok.cleanup_error = Some("export failed".to_string());
        assert_eq!(report(vec![ok]).exit_code(), EXIT_NODE_FAILURE);
    }

    #[test]
    fn test_serializes_without_empty_fields() {
        let r = report(vec![node("a", NodeStatus::Failed)]);
        assert_eq!(r.status_of("shell.a"), Some(NodeStatus::Failed));

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["nodes"][0]["status"], "failed");
        assert_eq!(json["nodes"][0]["failure"], "execution");
        assert_eq!(json["nodes"][0]["id"], "shell.a");
        assert!(json["nodes"][0].get("cleanup_error").is_none());
        assert!(json.get("state_errors").is_none());
    }
}
