use std::collections::{HashMap, HashSet};

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::types::{Dependency, Step, Workflow};

/// Pure in-memory step graph.
///
/// Invariant: every edge's endpoints reference existing steps. All
/// operations are side-effect-free transformations; the caller persists the
/// result atomically.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    steps: HashMap<String, Step>,
    edges: HashSet<(String, String)>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a workflow document, validating every edge.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let mut graph = Self::new();
        for step in &workflow.steps {
            graph.add_step(step.clone());
        }
        for dep in &workflow.dependencies {
            graph.add_edge(&dep.source, &dep.target)?;
        }
        Ok(graph)
    }

    /// Insert or replace a step.
    pub fn add_step(&mut self, step: Step) {
        self.steps.insert(step.id.clone(), step);
    }

    /// Remove a step; cascades removal of every edge touching it.
    /// Returns false if the step was not present.
    pub fn remove_step(&mut self, step_id: &str) -> bool {
        if self.steps.remove(step_id).is_none() {
            return false;
        }
        self.edges
            .retain(|(source, target)| source != step_id && target != step_id);
        true
    }

    /// Add an edge meaning "target depends on source".
    pub fn add_edge(&mut self, source: &str, target: &str) -> Result<()> {
        if source == target {
            return Err(AuditflowError::SelfLoop(source.to_string()));
        }
        for endpoint in [source, target] {
            if !self.steps.contains_key(endpoint) {
                return Err(AuditflowError::InvalidReference(endpoint.to_string()));
            }
        }
        self.edges.insert((source.to_string(), target.to_string()));
        Ok(())
    }

    pub fn remove_edge(&mut self, source: &str, target: &str) -> bool {
        self.edges
            .remove(&(source.to_string(), target.to_string()))
    }

    pub fn contains_step(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }

    /// Source ids of edges whose target is `step_id`.
    pub fn upstream_of(&self, step_id: &str) -> Vec<String> {
        let mut up: Vec<String> = self
            .edges
            .iter()
            .filter(|(_, target)| target == step_id)
            .map(|(source, _)| source.clone())
            .collect();
        up.sort();
        up
    }

    /// Target ids of edges whose source is `step_id`.
    pub fn downstream_of(&self, step_id: &str) -> Vec<String> {
        let mut down: Vec<String> = self
            .edges
            .iter()
            .filter(|(source, _)| source == step_id)
            .map(|(_, target)| target.clone())
            .collect();
        down.sort();
        down
    }

    /// All step ids, sorted for stable display.
    pub fn all_step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.steps.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        let mut deps: Vec<Dependency> = self
            .edges
            .iter()
            .map(|(source, target)| Dependency::new(source.clone(), target.clone()))
            .collect();
        deps.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        deps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn edge_set(&self) -> &HashSet<(String, String)> {
        &self.edges
    }

    pub(crate) fn step_id_refs(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditflow_core::types::UserId;

    fn three_step_graph() -> StepGraph {
        let mut g = StepGraph::new();
        g.add_step(Step::new("a", "Collect evidence"));
        g.add_step(Step::new("b", "Interview owners"));
        g.add_step(Step::new("c", "Write findings"));
        g
    }

    #[test]
    fn add_edge_rejects_missing_endpoint() {
        let mut g = three_step_graph();
        let err = g.add_edge("a", "missing").unwrap_err();
        assert!(matches!(err, AuditflowError::InvalidReference(id) if id == "missing"));

        let err = g.add_edge("missing", "a").unwrap_err();
        assert!(matches!(err, AuditflowError::InvalidReference(_)));
    }

    #[test]
    fn add_edge_rejects_self_loop() {
        let mut g = three_step_graph();
        let err = g.add_edge("a", "a").unwrap_err();
        assert!(matches!(err, AuditflowError::SelfLoop(id) if id == "a"));
    }

    #[test]
    fn remove_step_cascades_edges() {
        let mut g = three_step_graph();
        g.add_edge("a", "c").unwrap();
        g.add_edge("b", "c").unwrap();

        assert!(g.remove_step("c"));
        assert!(g.dependencies().is_empty());
        assert_eq!(g.all_step_ids(), vec!["a", "b"]);

        assert!(!g.remove_step("c"));
    }

    #[test]
    fn upstream_and_downstream() {
        let mut g = three_step_graph();
        g.add_edge("a", "c").unwrap();
        g.add_edge("b", "c").unwrap();

        assert_eq!(g.upstream_of("c"), vec!["a", "b"]);
        assert!(g.upstream_of("a").is_empty());
        assert_eq!(g.downstream_of("a"), vec!["c"]);
    }

    #[test]
    fn from_workflow_validates_edges() {
        let mut wf = Workflow::new(UserId::from_str("u1"), "q3-audit", "Q3 Audit");
        wf.steps.push(Step::new("a", "A"));
        wf.dependencies.push(Dependency::new("a", "ghost"));

        let err = StepGraph::from_workflow(&wf).unwrap_err();
        assert!(matches!(err, AuditflowError::InvalidReference(_)));
    }

    #[test]
    fn fan_out_allows_shared_source() {
        let mut g = three_step_graph();
        g.add_edge("a", "b").unwrap();
        g.add_edge("a", "c").unwrap();
        assert_eq!(g.downstream_of("a"), vec!["b", "c"]);
    }
}
