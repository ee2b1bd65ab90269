//! Static execution graph.
//!
//! Edges come from two sources: every `_group:` token makes the referenced
//! instance a predecessor of the referencing one, and instances of the same
//! type are chained in declaration order unless marked `independent`.
//! Secret tokens never add edges.

use crate::config::{InstanceId, PipelineSpec};
use crate::errors::{CycleDetectedError, OrchestratorError, ReferenceError, ReferenceFailure};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The successor holds a `_group:` reference to the predecessor.
    Reference,
    /// Same-type declaration order.
    Declaration,
}

/// A directed acyclic graph over declared instances.
///
/// Node indices are declaration positions, so ordering by index is the
/// scheduling tie-break.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: Vec<InstanceId>,
    index: HashMap<InstanceId, usize>,
    predecessors: Vec<BTreeSet<usize>>,
    successors: Vec<BTreeSet<usize>>,
    edge_kinds: BTreeMap<(usize, usize), EdgeKind>,
}

impl ExecutionGraph {
    /// Builds and validates the graph for `spec`.
    ///
    /// Fails with a [`ReferenceError`] for a group reference to an
    /// undeclared instance and with a [`CycleDetectedError`] for a cycle.
    pub fn build(spec: &PipelineSpec) -> Result<Self, OrchestratorError> {
        let nodes: Vec<InstanceId> = spec.instances().map(|i| i.id()).collect();
        let index = nodes.iter().cloned().enumerate().map(|(i, id)| (id, i)).collect();
        let mut graph = Self {
            predecessors: vec![BTreeSet::new(); nodes.len()],
            successors: vec![BTreeSet::new(); nodes.len()],
            edge_kinds: BTreeMap::new(),
            nodes,
            index,
        };

        for (to, instance) in spec.instances().enumerate() {
            for token in instance.template.tokens() {
                let Some(source) = token.source() else {
                    continue;
                };
                let from = graph.index_of(&source).ok_or_else(|| {
                    ReferenceError::new(
                        token.to_string(),
                        instance.id().to_string(),
                        ReferenceFailure::UnknownInstance,
                        format!("'{source}' is not declared in this pipeline"),
                    )
                })?;
                graph.add_edge(from, to, EdgeKind::Reference);
            }
        }

        if spec.core.sequential_within_type {
            let mut position = 0;
            for section in &spec.sections {
                let mut previous: Option<usize> = None;
                for instance in &section.instances {
                    let current = position;
                    position += 1;
                    if instance.independent {
                        continue;
                    }
                    if let Some(prev) = previous {
                        if graph.reaches(current, prev) {
                            debug!(
                                earlier = %graph.nodes[prev],
                                later = %graph.nodes[current],
                                "Skipping declaration-order edge against an explicit reference"
                            );
                        } else {
                            graph.add_edge(prev, current, EdgeKind::Declaration);
                        }
                    }
                    previous = Some(current);
                }
            }
        }

        if let Some(cycle) = graph.detect_cycle() {
            return Err(CycleDetectedError::new(cycle.iter().map(|&i| graph.nodes[i].to_string()).collect()).into());
        }

        debug!(nodes = graph.len(), edges = graph.edge_kinds.len(), "Built execution graph");
        Ok(graph)
    }

    fn add_edge(&mut self, from: usize, to: usize, kind: EdgeKind) {
        self.successors[from].insert(to);
        self.predecessors[to].insert(from);
        self.edge_kinds.entry((from, to)).or_insert(kind);
    }

    /// Returns true if `to` is reachable from `from`.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if std::mem::replace(&mut seen[node], true) {
                continue;
            }
            stack.extend(self.successors[node].iter().copied());
        }
        false
    }

    /// Finds a cycle, listed so each node is followed by one it depends on.
    fn detect_cycle(&self) -> Option<Vec<usize>> {
        let mut visited = vec![false; self.nodes.len()];
        let mut rec_stack = vec![false; self.nodes.len()];
        let mut path = Vec::new();

        for node in 0..self.nodes.len() {
            if !visited[node] {
                if let Some(cycle) = self.dfs_cycle(node, &mut visited, &mut rec_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: usize,
        visited: &mut [bool],
        rec_stack: &mut [bool],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        visited[node] = true;
        rec_stack[node] = true;
        path.push(node);

        for &next in &self.predecessors[node] {
            if !visited[next] {
                if let Some(cycle) = self.dfs_cycle(next, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack[next] {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
        }

        path.pop();
        rec_stack[node] = false;
        None
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true for an empty pipeline.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in declaration order.
    #[must_use]
    pub fn node_ids(&self) -> &[InstanceId] {
        &self.nodes
    }

    /// Returns the id at `index`.
    #[must_use]
    pub fn id(&self, index: usize) -> Option<&InstanceId> {
        self.nodes.get(index)
    }

    /// Returns the index of `id`.
    #[must_use]
    pub fn index_of(&self, id: &InstanceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Direct predecessors of a node.
    #[must_use]
    pub fn predecessors(&self, index: usize) -> &BTreeSet<usize> {
        &self.predecessors[index]
    }

    /// Direct successors of a node.
    #[must_use]
    pub fn successors(&self, index: usize) -> &BTreeSet<usize> {
        &self.successors[index]
    }

    /// All transitive dependents of a node.
    #[must_use]
    pub fn dependents(&self, index: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<usize> = self.successors[index].iter().copied().collect();
        while let Some(node) = stack.pop() {
            if out.insert(node) {
                stack.extend(self.successors[node].iter().copied());
            }
        }
        out
    }

    /// Every edge as `(from, to, kind)`.
    #[must_use]
    pub fn edges(&self) -> Vec<(&InstanceId, &InstanceId, EdgeKind)> {
        self.edge_kinds
            .iter()
            .map(|(&(from, to), &kind)| (&self.nodes[from], &self.nodes[to], kind))
            .collect()
    }

    /// A topological order, breaking ties by declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&InstanceId> {
        let mut remaining: Vec<usize> = self.predecessors.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.nodes.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_first() {
            order.push(&self.nodes[node]);
            for &next in &self.successors[node] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn build(doc: &str) -> Result<ExecutionGraph, OrchestratorError> {
        ExecutionGraph::build(&PipelineSpec::from_yaml_str(doc).unwrap())
    }

    fn order(graph: &ExecutionGraph) -> Vec<String> {
        graph.topological_order().iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_reference_edges_override_section_order() {
        // The ansible section comes first but depends on terraform.
        let graph = build(
            r"
p:
  ansible:
    - name: site
      host: _group:terraform:proxmox:master:master-01
  terraform:
    - name: proxmox
",
        )
        .unwrap();
        assert_eq!(order(&graph), vec!["terraform.proxmox", "ansible.site"]);
        assert_eq!(graph.edges()[0].2, EdgeKind::Reference);
    }

    #[test]
    fn test_same_type_chain() {
        let graph = build(
            r"
p:
  shell:
    - name: a
    - name: b
    - name: c
      independent: true
",
        )
        .unwrap();
        let a = graph.index_of(&InstanceId::new("shell", "a")).unwrap();
        let b = graph.index_of(&InstanceId::new("shell", "b")).unwrap();
        let c = graph.index_of(&InstanceId::new("shell", "c")).unwrap();
        assert!(graph.predecessors(b).contains(&a));
        assert!(graph.predecessors(c).is_empty());
    }

    #[test]
    fn test_sequential_within_type_disabled() {
        let graph = build(
            r"
p:
  core:
    sequential_within_type: false
  shell:
    - name: a
    - name: b
",
        )
        .unwrap();
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_backward_reference_within_type_skips_implicit_edge() {
        // a consumes b's output, so the declaration chain must not force a before b.
        let graph = build(
            r"
p:
  shell:
    - name: a
      input: _group:shell:b:out
    - name: b
",
        )
        .unwrap();
        assert_eq!(order(&graph), vec!["shell.b", "shell.a"]);
    }

    #[test]
    fn test_cycle_lists_every_member() {
        let err = build(
            r"
p:
  terraform:
    - name: a
      x: _group:ansible:b:out
  ansible:
    - name: b
      y: _group:helm:c:out
  helm:
    - name: c
      z: _group:terraform:a:out
",
        )
        .unwrap_err();
        match err {
            OrchestratorError::CycleDetected(cycle) => {
                assert_eq!(
                    cycle.cycle_path,
                    vec!["terraform.a", "ansible.b", "helm.c", "terraform.a"]
                );
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let err = build("p:\n  shell:\n    - name: a\n      x: _group:shell:a:out\n").unwrap_err();
        assert!(matches!(err, OrchestratorError::CycleDetected(ref c) if c.cycle_path == vec!["shell.a", "shell.a"]));
    }

    #[test]
    fn test_undeclared_reference_target() {
        let err = build("p:\n  shell:\n    - name: a\n      x: _group:terraform:ghost:out\n").unwrap_err();
        match err {
            OrchestratorError::Reference(e) => {
                assert_eq!(e.reason, ReferenceFailure::UnknownInstance);
                assert_eq!(e.requester, "shell.a");
            }
            other => panic!("expected reference error, got {other}"),
        }
    }

    #[test]
    fn test_secret_tokens_add_no_edges() {
        let graph = build(
            r"
p:
  secrets:
    - name: vault
      key: v
  shell:
    - name: a
      password: _secret:vault:key
      independent: true
",
        )
        .unwrap();
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_dependents_are_transitive() {
        let graph = build(
            r"
p:
  shell:
    - name: a
    - name: b
    - name: c
",
        )
        .unwrap();
        let expected: BTreeSet<usize> = [1, 2].into_iter().collect();
        assert_eq!(graph.dependents(0), expected);
        assert!(graph.dependents(2).is_empty());
    }
}
