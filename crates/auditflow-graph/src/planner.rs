use std::collections::{BTreeSet, HashMap, HashSet};

use auditflow_core::error::{AuditflowError, Result};
use auditflow_core::types::StepResult;

use crate::model::StepGraph;

/// Plans execution over a step graph against the acting user's recorded
/// results.
///
/// Planning is cheap and side-effect-free. Callers must re-plan after every
/// approval rather than precomputing waves ahead — approval is the only
/// thing that changes which steps are ready.
pub struct ExecutionPlanner<'a> {
    graph: &'a StepGraph,
    completed: HashSet<String>,
}

impl<'a> ExecutionPlanner<'a> {
    /// Build a planner from the user's step results. Only results with
    /// `completed = true` satisfy a dependency; drafts do not.
    pub fn new(graph: &'a StepGraph, results: &[StepResult]) -> Self {
        let completed = results
            .iter()
            .filter(|r| r.completed)
            .map(|r| r.step_id.clone())
            .collect();
        Self { graph, completed }
    }

    pub fn with_completed(graph: &'a StepGraph, completed: HashSet<String>) -> Self {
        Self { graph, completed }
    }

    /// Kahn's algorithm over in-degree counts.
    ///
    /// Returns every step exactly once with all edges respected, or
    /// `CyclicWorkflow` naming one node on a cycle. Never returns a partial
    /// order silently.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> =
            self.graph.step_id_refs().map(|id| (id, 0)).collect();
        for (_, target) in self.graph.edge_set() {
            if let Some(d) = in_degree.get_mut(target.as_str()) {
                *d += 1;
            }
        }

        // BTreeSet gives a stable pop order; within-level order carries no
        // execution semantics.
        let mut available: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(id) = available.iter().next().copied() {
            available.remove(id);
            order.push(id.to_string());
            for next in self.graph.downstream_of(id) {
                if let Some(d) = in_degree.get_mut(next.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        if let Some(step) = self.graph.step(&next) {
                            available.insert(step.id.as_str());
                        }
                    }
                }
            }
        }

        if order.len() < in_degree.len() {
            let mut remaining: Vec<&str> = in_degree
                .keys()
                .filter(|id| !order.iter().any(|o| o == *id))
                .copied()
                .collect();
            remaining.sort();
            // Any leftover node sits on or downstream of a cycle; report the
            // first for diagnostics.
            return Err(AuditflowError::CyclicWorkflow(
                remaining.first().unwrap_or(&"?").to_string(),
            ));
        }

        Ok(order)
    }

    /// Incomplete steps whose every upstream dependency has a completed
    /// result. Steps with no dependencies are always eligible once
    /// incomplete. Sorted for stable display only.
    pub fn ready_frontier(&self) -> Vec<String> {
        self.frontier_given(&self.completed)
    }

    /// Partition the remaining work into waves: wave k is the frontier
    /// assuming waves 0..k-1 completed.
    ///
    /// Advisory — maximal safe concurrency for display and dry-runs. The
    /// dispatch path must still re-plan after every approval (see
    /// `ready_frontier`).
    pub fn parallel_groups(&self) -> Result<Vec<Vec<String>>> {
        // Surfaces CyclicWorkflow before any partial partition escapes.
        self.topological_order()?;

        let mut assumed = self.completed.clone();
        let mut waves = Vec::new();
        loop {
            let wave = self.frontier_given(&assumed);
            if wave.is_empty() {
                break;
            }
            assumed.extend(wave.iter().cloned());
            waves.push(wave);
        }
        Ok(waves)
    }

    fn frontier_given(&self, done: &HashSet<String>) -> Vec<String> {
        let mut ready: Vec<String> = self
            .graph
            .all_step_ids()
            .into_iter()
            .filter(|id| !done.contains(id))
            .filter(|id| {
                self.graph
                    .upstream_of(id)
                    .iter()
                    .all(|up| done.contains(up))
            })
            .collect();
        ready.sort();
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditflow_core::types::{Step, UserId, WorkflowId};

    fn graph(steps: &[&str], edges: &[(&str, &str)]) -> StepGraph {
        let mut g = StepGraph::new();
        for id in steps {
            g.add_step(Step::new(*id, *id));
        }
        for (s, t) in edges {
            g.add_edge(s, t).unwrap();
        }
        g
    }

    fn completed_result(step_id: &str) -> StepResult {
        StepResult::completed(
            UserId::from_str("u1"),
            WorkflowId::from_str("w1"),
            step_id,
            "done",
        )
    }

    #[test]
    fn topological_order_respects_edges() {
        let g = graph(
            &["a", "b", "c", "d"],
            &[("a", "c"), ("b", "c"), ("c", "d")],
        );
        let planner = ExecutionPlanner::new(&g, &[]);
        let order = planner.topological_order().unwrap();

        assert_eq!(order.len(), 4);
        for (s, t) in [("a", "c"), ("b", "c"), ("c", "d")] {
            let si = order.iter().position(|x| x == s).unwrap();
            let ti = order.iter().position(|x| x == t).unwrap();
            assert!(si < ti, "{} must precede {}", s, t);
        }
    }

    #[test]
    fn topological_order_covers_every_step_once() {
        let g = graph(&["a", "b", "c"], &[("a", "b")]);
        let planner = ExecutionPlanner::new(&g, &[]);
        let mut order = planner.topological_order().unwrap();
        order.sort();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn two_node_cycle_is_fatal_and_names_an_offender() {
        let g = graph(&["x", "y"], &[("x", "y"), ("y", "x")]);
        let planner = ExecutionPlanner::new(&g, &[]);
        match planner.topological_order() {
            Err(AuditflowError::CyclicWorkflow(node)) => {
                assert!(node == "x" || node == "y");
            }
            other => panic!("expected CyclicWorkflow, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn cycle_behind_valid_prefix_still_fails() {
        let g = graph(&["a", "x", "y"], &[("a", "x"), ("x", "y"), ("y", "x")]);
        let planner = ExecutionPlanner::new(&g, &[]);
        assert!(matches!(
            planner.topological_order(),
            Err(AuditflowError::CyclicWorkflow(_))
        ));
    }

    #[test]
    fn frontier_is_roots_when_nothing_completed() {
        // C depends on both A and B.
        let g = graph(&["a", "b", "c"], &[("a", "c"), ("b", "c")]);
        let planner = ExecutionPlanner::new(&g, &[]);
        assert_eq!(planner.ready_frontier(), vec!["a", "b"]);
    }

    #[test]
    fn frontier_advances_after_both_upstreams_complete() {
        let g = graph(&["a", "b", "c"], &[("a", "c"), ("b", "c")]);

        let partial = [completed_result("a")];
        let planner = ExecutionPlanner::new(&g, &partial);
        // B is still ready; C must not appear with A done but B pending.
        assert_eq!(planner.ready_frontier(), vec!["b"]);

        let both = [completed_result("a"), completed_result("b")];
        let planner = ExecutionPlanner::new(&g, &both);
        assert_eq!(planner.ready_frontier(), vec!["c"]);
    }

    #[test]
    fn draft_results_do_not_satisfy_dependencies() {
        let g = graph(&["a", "b"], &[("a", "b")]);
        let draft = StepResult::draft(
            UserId::from_str("u1"),
            WorkflowId::from_str("w1"),
            "a",
            "pending review",
        );
        let planner = ExecutionPlanner::new(&g, &[draft]);
        assert_eq!(planner.ready_frontier(), vec!["a"]);
    }

    #[test]
    fn parallel_groups_form_waves() {
        let g = graph(
            &["a", "b", "c", "d"],
            &[("a", "c"), ("b", "c"), ("c", "d")],
        );
        let planner = ExecutionPlanner::new(&g, &[]);
        let waves = planner.parallel_groups().unwrap();
        assert_eq!(
            waves,
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".into()], vec!["d".into()]]
        );
    }

    #[test]
    fn parallel_groups_skip_completed_steps() {
        let g = graph(&["a", "b", "c"], &[("a", "c"), ("b", "c")]);
        let planner = ExecutionPlanner::new(&g, &[completed_result("a"), completed_result("b")]);
        let waves = planner.parallel_groups().unwrap();
        assert_eq!(waves, vec![vec!["c".to_string()]]);
    }

    #[test]
    fn parallel_groups_reject_cycles() {
        let g = graph(&["x", "y"], &[("x", "y"), ("y", "x")]);
        let planner = ExecutionPlanner::new(&g, &[]);
        assert!(matches!(
            planner.parallel_groups(),
            Err(AuditflowError::CyclicWorkflow(_))
        ));
    }

    #[test]
    fn empty_graph_plans_to_nothing() {
        let g = StepGraph::new();
        let planner = ExecutionPlanner::new(&g, &[]);
        assert!(planner.topological_order().unwrap().is_empty());
        assert!(planner.ready_frontier().is_empty());
        assert!(planner.parallel_groups().unwrap().is_empty());
    }
}
