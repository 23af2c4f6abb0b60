use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use waypoint_core::error::{Result, WaypointError};

use crate::context::AgentContext;
use crate::decision::{DecisionInput, NextStepDecisionChain};
use crate::execution::StepExecution;
use crate::step::Step;

/// Steps and the legal transitions between them.
///
/// Every step id named as a start or transition target is checked at
/// construction, so a graph that builds never fails lookups mid-run.
/// Cycles are allowed here; the executor's repeat guard decides whether
/// they may actually be walked.
#[derive(Debug)]
pub struct StepGraph {
    steps: Vec<Arc<dyn Step>>,
    index: HashMap<String, usize>,
    transitions: HashMap<String, Vec<String>>,
    start: usize,
    decision_chain: NextStepDecisionChain,
}

impl StepGraph {
    /// Build a graph. `steps` order is the declaration order used to rank
    /// candidates.
    pub fn new(
        steps: Vec<Arc<dyn Step>>,
        transitions: HashMap<String, Vec<String>>,
        start: impl Into<String>,
    ) -> Result<Self> {
        let start = start.into();
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id().to_string(), i).is_some() {
                return Err(WaypointError::Config(format!(
                    "duplicate step id '{}'",
                    step.id()
                )));
            }
        }

        let start_idx = *index
            .get(&start)
            .ok_or_else(|| WaypointError::Config(format!("start step '{start}' is not registered")))?;

        for (from, targets) in &transitions {
            if !index.contains_key(from) {
                return Err(WaypointError::Config(format!(
                    "transition source '{from}' is not a registered step"
                )));
            }
            if let Some(bad) = targets.iter().find(|t| !index.contains_key(t.as_str())) {
                return Err(WaypointError::Config(format!(
                    "transition '{from}' -> '{bad}' targets an unregistered step"
                )));
            }
        }

        Ok(Self {
            steps,
            index,
            transitions,
            start: start_idx,
            decision_chain: NextStepDecisionChain::default(),
        })
    }

    pub fn with_decision_chain(mut self, chain: NextStepDecisionChain) -> Self {
        self.decision_chain = chain;
        self
    }

    pub fn start_step(&self) -> Arc<dyn Step> {
        self.steps[self.start].clone()
    }

    pub fn step(&self, id: &str) -> Option<Arc<dyn Step>> {
        self.index.get(id).map(|&i| self.steps[i].clone())
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn transitions_from(&self, id: &str) -> &[String] {
        self.transitions.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn decision_chain(&self) -> &NextStepDecisionChain {
        &self.decision_chain
    }

    /// Legal successors of `current_id`, deduplicated, in declaration order.
    pub fn possible_next_steps(&self, current_id: &str) -> Vec<Arc<dyn Step>> {
        let mut positions: Vec<usize> = self
            .transitions_from(current_id)
            .iter()
            .filter_map(|t| self.index.get(t).copied())
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions.into_iter().map(|i| self.steps[i].clone()).collect()
    }

    /// Resolve the step to run after `current`.
    ///
    /// No candidates ends the workflow. A single candidate is taken without
    /// consulting the decision chain.
    pub async fn select_next_step(
        &self,
        current: &Arc<dyn Step>,
        candidates: &[Arc<dyn Step>],
        last_execution: Option<&StepExecution>,
        ctx: &AgentContext,
    ) -> Result<Option<Arc<dyn Step>>> {
        match candidates {
            [] => Ok(None),
            [only] => Ok(Some(only.clone())),
            _ => {
                let input = DecisionInput {
                    current,
                    candidates,
                    last_execution,
                };
                self.decision_chain.decide(&input, ctx).await
            }
        }
    }

    /// Whether no step can reach itself.
    pub fn is_acyclic(&self) -> bool {
        // Kahn's algorithm over registered steps.
        let mut in_degree: HashMap<&str, usize> =
            self.steps.iter().map(|s| (s.id(), 0)).collect();
        for targets in self.transitions.values() {
            let unique: HashSet<&str> = targets.iter().map(String::as_str).collect();
            for t in unique {
                if let Some(d) = in_degree.get_mut(t) {
                    *d += 1;
                }
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop() {
            visited += 1;
            let unique: HashSet<&str> = self.transitions_from(id).iter().map(String::as_str).collect();
            for t in unique {
                if let Some(d) = in_degree.get_mut(t) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(t);
                    }
                }
            }
        }
        visited == self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::ToolStep;

    fn steps(ids: &[&str]) -> Vec<Arc<dyn Step>> {
        ids.iter()
            .map(|id| Arc::new(ToolStep::new(*id)) as Arc<dyn Step>)
            .collect()
    }

    fn edges(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(from, to)| (from.to_string(), to.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_candidates_follow_declaration_order() {
        let graph = StepGraph::new(
            steps(&["a", "b", "c", "d"]),
            edges(&[("a", &["d", "b", "c", "b"])]),
            "a",
        )
        .unwrap();
        let ids: Vec<String> = graph
            .possible_next_steps("a")
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, ["b", "c", "d"]);
        assert!(graph.possible_next_steps("d").is_empty());
    }

    #[test]
    fn test_rejects_unknown_target() {
        let err = StepGraph::new(steps(&["a"]), edges(&[("a", &["ghost"])]), "a").unwrap_err();
        assert!(matches!(err, WaypointError::Config(msg) if msg.contains("ghost")));
    }

    #[test]
    fn test_rejects_unknown_start_and_duplicates() {
        assert!(StepGraph::new(steps(&["a"]), HashMap::new(), "b").is_err());
        assert!(StepGraph::new(steps(&["a", "a"]), HashMap::new(), "a").is_err());
    }

    #[test]
    fn test_is_acyclic() {
        let dag = StepGraph::new(
            steps(&["a", "b", "c"]),
            edges(&[("a", &["b", "c"]), ("b", &["c"])]),
            "a",
        )
        .unwrap();
        assert!(dag.is_acyclic());

        let cyclic = StepGraph::new(
            steps(&["a", "b"]),
            edges(&[("a", &["b"]), ("b", &["a"])]),
            "a",
        )
        .unwrap();
        assert!(!cyclic.is_acyclic());
        assert_eq!(cyclic.start_step().id(), "a");
    }
}
