use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use waypoint_core::error::Result;
use waypoint_core::types::WorkflowEvent;

use crate::context::AgentContext;
use crate::execution::StepExecution;
use crate::graph::StepGraph;
use crate::step::Step;

/// Tracks where a workflow run is in its graph.
///
/// `current` is `None` once the workflow has finished.
#[derive(Debug)]
pub struct StepManager {
    graph: StepGraph,
    current: Option<Arc<dyn Step>>,
    /// Most recent activation of each step.
    last_executions: HashMap<String, StepExecution>,
}

impl StepManager {
    pub fn new(graph: StepGraph) -> Self {
        let current = Some(graph.start_step());
        Self {
            graph,
            current,
            last_executions: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn current_step(&self) -> Option<Arc<dyn Step>> {
        self.current.clone()
    }

    pub fn is_workflow_complete(&self) -> bool {
        self.current.is_none()
    }

    pub fn record_execution(&mut self, execution: StepExecution) {
        self.last_executions
            .insert(execution.step_id().to_string(), execution);
    }

    pub fn last_execution(&self, step_id: &str) -> Option<&StepExecution> {
        self.last_executions.get(step_id)
    }

    /// Move the pointer to the next step, or clear it when there is none.
    pub async fn advance_to_next_step(&mut self, ctx: &AgentContext) -> Result<Option<Arc<dyn Step>>> {
        let Some(current) = self.current.clone() else {
            return Ok(None);
        };

        let candidates = self.graph.possible_next_steps(current.id());
        debug!(
            step = %current.id(),
            candidates = candidates.len(),
            "Advancing workflow"
        );
        let next = self
            .graph
            .select_next_step(
                &current,
                &candidates,
                self.last_executions.get(current.id()),
                ctx,
            )
            .await?;

        match &next {
            Some(step) => {
                info!(from = %current.id(), to = %step.id(), "Next step chosen");
                ctx.publish(WorkflowEvent::NextStepChosen {
                    from: current.id().to_string(),
                    to: step.id().to_string(),
                });
            }
            None => info!(step = %current.id(), "No next step, workflow complete"),
        }
        self.current = next.clone();
        Ok(next)
    }

    /// Back to the start step with no recorded executions.
    pub fn reset(&mut self) {
        self.current = Some(self.graph.start_step());
        self.last_executions.clear();
    }
}
