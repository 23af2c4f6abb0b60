use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::{ChatMessage, StepStatus, WorkflowEvent};

use crate::completion::StepCompletionChain;
use crate::context::AgentContext;
use crate::execution::StepExecution;
use crate::graph::StepGraph;
use crate::manager::StepManager;
use crate::step::Step;
use crate::step_executor::StepExecutor;

/// Everything a finished workflow run produced.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Step activations in the order they ran.
    pub executions: Vec<StepExecution>,
    pub total_elapsed_ms: u64,
}

impl AgentResult {
    /// No activation ended FAILED.
    pub fn succeeded(&self) -> bool {
        self.executions
            .iter()
            .all(|e| e.status() != StepStatus::Failed)
    }

    pub fn executions_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepExecution> + 'a {
        self.executions.iter().filter(move |e| e.step_id() == step_id)
    }

    /// Step ids in activation order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.executions.iter().map(StepExecution::step_id).collect()
    }

    /// Output of the last activation that produced one.
    pub fn final_output(&self) -> Option<String> {
        self.executions.iter().rev().find_map(StepExecution::output)
    }
}

/// Walks a step graph from its start step until no next step remains.
///
/// A step id may only run once per run unless repeats are allowed; a
/// revisit is a fatal error and is the only loop guard. A step that ends
/// FAILED aborts the run unless `continue_on_step_failure` is set.
///
/// The run works on a child of the context's cancel token. When
/// `max_duration_secs` passes, only that child is cancelled, so the step in
/// flight unwinds through its normal rollback path before the run reports
/// [`WaypointError::MaxDurationExceeded`].
pub struct AgentExecutor {
    ctx: AgentContext,
    manager: StepManager,
    goal: Option<String>,
    completion_chain: StepCompletionChain,
}

impl AgentExecutor {
    pub fn new(graph: StepGraph, ctx: AgentContext) -> Self {
        if !ctx.config.allow_repeated_steps && !graph.is_acyclic() {
            warn!("Step graph has cycles but repeated steps are not allowed; revisits will abort the run");
        }
        Self {
            ctx,
            manager: StepManager::new(graph),
            goal: None,
            completion_chain: StepCompletionChain::default(),
        }
    }

    /// Seed the conversation with the workflow goal as a system message.
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn with_completion_chain(mut self, chain: StepCompletionChain) -> Self {
        self.completion_chain = chain;
        self
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn manager(&self) -> &StepManager {
        &self.manager
    }

    /// Run the workflow on the tokio pool.
    pub fn spawn(mut self) -> JoinHandle<Result<AgentResult>> {
        tokio::spawn(async move { self.execute().await })
    }

    pub async fn execute(&mut self) -> Result<AgentResult> {
        let start = Instant::now();
        info!(
            conversation = %self.ctx.conversation_id,
            start_step = %self.manager.graph().start_step().id(),
            "Workflow started"
        );
        self.ctx.publish(WorkflowEvent::WorkflowStarted {
            conversation_id: self.ctx.conversation_id.clone(),
        });

        let parent = self.ctx.cancel.clone();
        let run_token = parent.child_token();
        self.ctx.cancel = run_token.clone();
        let limit = self.ctx.config.max_duration();
        let deadline = limit.map(|limit| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!(limit_secs = limit.as_secs(), "Workflow hit its max duration, cancelling");
                        token.cancel();
                    }
                }
            })
        });

        let mut executions = Vec::new();
        let mut outcome = self.run_steps(&mut executions).await;

        if let Some(handle) = deadline {
            handle.abort();
        }
        self.ctx.cancel = parent.clone();
        if let Some(limit) = limit {
            let deadline_hit = run_token.is_cancelled() && !parent.is_cancelled();
            if deadline_hit && matches!(outcome, Err(WaypointError::Cancelled)) {
                outcome = Err(WaypointError::MaxDurationExceeded(limit.as_secs()));
            }
        }

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                info!(
                    activations = executions.len(),
                    elapsed_ms = total_elapsed_ms,
                    "Workflow complete"
                );
                self.ctx.publish(WorkflowEvent::WorkflowComplete {
                    activations: executions.len(),
                });
                Ok(AgentResult {
                    executions,
                    total_elapsed_ms,
                })
            }
            Err(e) => {
                error!(error = %e, activations = executions.len(), "Workflow failed");
                self.ctx.publish(WorkflowEvent::WorkflowFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_steps(&mut self, executions: &mut Vec<StepExecution>) -> Result<()> {
        if let Some(goal) = &self.goal {
            self.ctx
                .memory
                .save_all(&self.ctx.conversation_id, vec![ChatMessage::system(goal.clone())])
                .await?;
        }

        let mut executed: HashSet<String> = HashSet::new();
        while let Some(step) = self.manager.current_step() {
            if self.ctx.is_cancelled() {
                return Err(WaypointError::Cancelled);
            }
            if executed.contains(step.id()) && !self.ctx.config.allow_repeated_steps {
                error!(step = %step.id(), "Step already executed, aborting to avoid a loop");
                return Err(WaypointError::StepAlreadyExecuted(step.id().to_string()));
            }

            let activation = executions.len() + 1;
            info!(step = %step.id(), activation, "Starting step");
            self.ctx.publish(WorkflowEvent::StepStarted {
                step_id: step.id().to_string(),
                activation,
            });

            let execution = self.create_step_executor(step.clone()).execute().await;
            executed.insert(step.id().to_string());
            self.manager.record_execution(execution.clone());
            let status = execution.status();
            let reason = execution.error().unwrap_or("unknown error").to_string();
            executions.push(execution);

            if status == StepStatus::Failed {
                if self.ctx.is_cancelled() {
                    return Err(WaypointError::Cancelled);
                }
                if !self.ctx.config.continue_on_step_failure {
                    return Err(WaypointError::StepFailed {
                        step: step.id().to_string(),
                        reason,
                    });
                }
                warn!(step = %step.id(), reason = %reason, "Step failed, continuing");
            }

            self.manager.advance_to_next_step(&self.ctx).await?;
        }
        Ok(())
    }

    fn create_step_executor(&self, step: Arc<dyn Step>) -> StepExecutor {
        StepExecutor::new(step, self.ctx.clone()).with_completion_chain(self.completion_chain.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::step::ToolStep;
    use crate::InMemoryModelMemory;
    use waypoint_core::config::ExecutionConfig;
    use waypoint_core::event::drain_ready;
    use waypoint_core::types::{CompletionInstruction, ModelCallResponse, Role, StepOutcome};
    use waypoint_test_utils::{RecordingTools, ScriptedModel};

    fn finished() -> ModelCallResponse {
        ModelCallResponse::text("done").with_completion(CompletionInstruction {
            done: true,
            ..Default::default()
        })
    }

    fn graph(ids: &[&str], pairs: &[(&str, &str)]) -> StepGraph {
        let steps = ids
            .iter()
            .map(|id| Arc::new(ToolStep::new(*id)) as Arc<dyn Step>)
            .collect();
        let mut transitions: HashMap<String, Vec<String>> = HashMap::new();
        for (from, to) in pairs {
            transitions
                .entry(from.to_string())
                .or_default()
                .push(to.to_string());
        }
        StepGraph::new(steps, transitions, ids[0]).unwrap()
    }

    fn ctx(model: ScriptedModel, config: ExecutionConfig) -> AgentContext {
        AgentContext::new(
            Arc::new(model),
            Arc::new(RecordingTools::new()),
            Arc::new(InMemoryModelMemory::new()),
        )
        .with_config(config)
    }

    #[tokio::test]
    async fn test_cycle_without_repeats_aborts() {
        let mut executor = AgentExecutor::new(
            graph(&["a", "b"], &[("a", "b"), ("b", "a")]),
            ctx(ScriptedModel::repeating(finished()), ExecutionConfig::default()),
        );
        let err = executor.execute().await.unwrap_err();
        match err {
            WaypointError::StepAlreadyExecuted(id) => assert_eq!(id, "a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failed_step_is_fatal_by_default() {
        let config = ExecutionConfig {
            max_model_calls_per_step: 1,
            ..Default::default()
        };
        let mut executor = AgentExecutor::new(
            graph(&["a", "b"], &[("a", "b")]),
            ctx(ScriptedModel::repeating(ModelCallResponse::text("hmm")), config),
        );
        let err = executor.execute().await.unwrap_err();
        assert!(matches!(err, WaypointError::StepFailed { ref step, .. } if step == "a"));
        assert_eq!(executor.manager().last_execution("a").unwrap().status(), StepStatus::Failed);
        assert!(executor.manager().last_execution("b").is_none());
    }

    #[tokio::test]
    async fn test_continue_on_step_failure() {
        let config = ExecutionConfig {
            max_model_calls_per_step: 1,
            continue_on_step_failure: true,
            ..Default::default()
        };
        let mut executor = AgentExecutor::new(
            graph(&["a", "b"], &[("a", "b")]),
            ctx(ScriptedModel::repeating(ModelCallResponse::text("hmm")), config),
        );
        let result = executor.execute().await.unwrap();
        assert_eq!(result.step_ids(), ["a", "b"]);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_goal_seeded_into_memory() {
        let model = Arc::new(ScriptedModel::repeating(finished()));
        let ctx = AgentContext::new(
            model.clone(),
            Arc::new(RecordingTools::new()),
            Arc::new(InMemoryModelMemory::new()),
        );
        let result = AgentExecutor::new(graph(&["only"], &[]), ctx)
            .with_goal("Plan a trip.")
            .spawn()
            .await
            .unwrap()
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.final_output().as_deref(), Some("done"));
        let first = &model.requests()[0];
        assert_eq!(first.messages[0].text(), "Plan a trip.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_aborts_run() {
        let config = ExecutionConfig {
            max_duration_secs: 5,
            ..Default::default()
        };
        let model = ScriptedModel::repeating(finished()).with_delay(std::time::Duration::from_secs(10));
        let mut executor = AgentExecutor::new(graph(&["a"], &[]), ctx(model, config));
        let err = executor.execute().await.unwrap_err();
        assert!(matches!(err, WaypointError::MaxDurationExceeded(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_unwinds_in_flight_tool() {
        let model = ScriptedModel::new(vec![
            ModelCallResponse::text("fetching").with_tool_call("crawl", serde_json::json!({})),
            finished(),
        ]);
        let tools = RecordingTools::new().with_delay("crawl", Duration::from_secs(20), "pages");
        let memory = Arc::new(InMemoryModelMemory::new());
        let config = ExecutionConfig {
            max_duration_secs: 5,
            ..Default::default()
        };
        let ctx = AgentContext::new(Arc::new(model), Arc::new(tools), memory.clone()).with_config(config);
        let conversation = ctx.conversation_id.clone();
        let caller_token = ctx.cancel_token();
        let mut events = ctx.event_bus.subscribe();
        let steps: Vec<Arc<dyn Step>> = vec![Arc::new(ToolStep::new("crawl").with_tools(["crawl"]))];
        let graph = StepGraph::new(steps, HashMap::new(), "crawl").unwrap();
        let mut executor = AgentExecutor::new(graph, ctx);

        let err = executor.execute().await.unwrap_err();
        assert!(matches!(err, WaypointError::MaxDurationExceeded(5)));
        assert!(!caller_token.is_cancelled());
        assert!(!executor.context().is_cancelled());

        // The tool attempt rolled back and the dispatch snapshot was released.
        assert_eq!(memory.snapshot_count(&conversation).await.unwrap(), 0);
        let history = memory.messages(&conversation).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Assistant);

        let events = drain_ready(&mut events);
        let finished_steps: Vec<_> = events.iter().filter_map(WorkflowEvent::finished_step).collect();
        assert_eq!(finished_steps, [("crawl", StepStatus::Failed)]);
    }

    #[tokio::test]
    async fn test_skipped_step_does_not_fail_run() {
        let model = ScriptedModel::new(vec![
            ModelCallResponse::text("nothing to triage").with_completion(CompletionInstruction {
                reason: Some("inbox empty".into()),
                ..CompletionInstruction::with_outcome(StepOutcome::Skipped)
            }),
            finished(),
        ]);
        let mut executor = AgentExecutor::new(
            graph(&["triage", "report"], &[("triage", "report")]),
            ctx(model, ExecutionConfig::default()),
        );
        let result = executor.execute().await.unwrap();
        assert_eq!(result.step_ids(), ["triage", "report"]);
        assert_eq!(result.executions[0].status(), StepStatus::Skipped);
        assert_eq!(result.executions[1].status(), StepStatus::Completed);
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn test_model_declared_cannot_finish_fails_run() {
        let model = ScriptedModel::new(vec![ModelCallResponse::text("stuck").with_completion(
            CompletionInstruction {
                reason: Some("credentials missing".into()),
                ..CompletionInstruction::with_outcome(StepOutcome::CanNotFinish)
            },
        )]);
        let mut executor = AgentExecutor::new(
            graph(&["deploy", "verify"], &[("deploy", "verify")]),
            ctx(model, ExecutionConfig::default()),
        );
        let err = executor.execute().await.unwrap_err();
        match err {
            WaypointError::StepFailed { step, reason } => {
                assert_eq!(step, "deploy");
                assert!(reason.contains("credentials missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(executor.manager().last_execution("verify").is_none());
    }
}
