// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dependency Scheduler (spec.md §4.5).
//!
//! Produces a topological order over a plan's steps that, within the DAG,
//! also respects each step's declared `order`. Uses `petgraph`, the
//! teacher workspace's declared graph-processing dependency.

use std::collections::{BTreeMap, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{EngineError, Result};
use crate::model::PlanStep;

/// Topologically sorts `steps`, breaking ties between steps with no
/// ordering relationship between them by their declared `order` field.
///
/// Errors with `EngineError::Dependency` on a cycle or a dependency that
/// names an unknown step id.
pub fn topological_order(steps: &[PlanStep]) -> Result<Vec<String>> {
    let mut graph = DiGraph::<String, ()>::new();
    let mut index_of: HashMap<String, NodeIndex> = HashMap::new();

    for step in steps {
        let idx = graph.add_node(step.id.clone());
        index_of.insert(step.id.clone(), idx);
    }

    for step in steps {
        let to = index_of[&step.id];
        for dep in &step.dependencies {
            let from = index_of.get(dep).ok_or_else(|| {
                EngineError::Dependency(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.id
                ))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    // Kahn's algorithm with a priority tie-break on `PlanStep.order`, so
    // that among steps whose dependencies are all satisfied, the one with
    // the lowest declared `order` goes first.
    let order_of: HashMap<&str, u32> = steps.iter().map(|s| (s.id.as_str(), s.order)).collect();

    let mut in_degree: BTreeMap<NodeIndex, usize> = BTreeMap::new();
    for idx in graph.node_indices() {
        in_degree.insert(idx, 0);
    }
    for edge in graph.edge_references() {
        *in_degree.get_mut(&edge.target()).unwrap() += 1;
    }

    let mut ready: Vec<NodeIndex> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(idx, _)| *idx)
        .collect();

    let mut result = Vec::with_capacity(steps.len());
    while !ready.is_empty() {
        ready.sort_by_key(|idx| order_of[graph[*idx].as_str()]);
        let next = ready.remove(0);
        result.push(graph[next].clone());

        for edge in graph.edges(next) {
            let target = edge.target();
            let deg = in_degree.get_mut(&target).unwrap();
            *deg -= 1;
            if *deg == 0 {
                ready.push(target);
            }
        }
    }

    if result.len() != steps.len() {
        return Err(EngineError::Dependency(
            "cycle detected in step dependency graph".to_string(),
        ));
    }

    Ok(result)
}

/// A step is eligible to run only when every id in its `dependencies`
/// already has an entry in `stepOutputs`. Because the topological order
/// already respects dependencies, this is primarily a safety net against
/// corrupt plans (spec.md §4.5).
pub fn is_eligible(step: &PlanStep, step_outputs: &std::collections::BTreeMap<String, crate::model::StepOutput>) -> bool {
    step.dependencies.iter().all(|dep| step_outputs.contains_key(dep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepStatus;
    use serde_json::json;

    fn step(id: &str, order: u32, deps: &[&str]) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            order,
            action: "noop".to_string(),
            parameters: json!({}),
            expected_output: String::new(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            status: StepStatus::Pending,
        }
    }

    #[test]
    fn linear_chain_preserves_order() {
        let steps = vec![step("a", 1, &[]), step("b", 2, &["a"]), step("c", 3, &["b"])];
        let order = topological_order(&steps).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn ties_broken_by_declared_order() {
        let steps = vec![step("b", 2, &[]), step("a", 1, &[])];
        let order = topological_order(&steps).unwrap();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn cycle_is_dependency_error() {
        let steps = vec![step("a", 1, &["b"]), step("b", 2, &["a"])];
        let err = topological_order(&steps).unwrap_err();
        assert!(matches!(err, EngineError::Dependency(_)));
    }

    #[test]
    fn unknown_dependency_is_dependency_error() {
        let steps = vec![step("a", 1, &["ghost"])];
        let err = topological_order(&steps).unwrap_err();
        assert!(matches!(err, EngineError::Dependency(_)));
    }

    #[test]
    fn zero_steps_sorts_to_empty() {
        let steps: Vec<PlanStep> = vec![];
        assert_eq!(topological_order(&steps).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn eligibility_requires_all_dependency_outputs() {
        let step = step("b", 1, &["a"]);
        let mut outputs = std::collections::BTreeMap::new();
        assert!(!is_eligible(&step, &outputs));
        outputs.insert("a".to_string(), crate::model::StepOutput::success(json!(null)));
        assert!(is_eligible(&step, &outputs));
    }
}
