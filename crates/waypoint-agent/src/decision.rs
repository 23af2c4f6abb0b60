use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::ToolContext;

use crate::context::AgentContext;
use crate::execution::StepExecution;
use crate::retry;
use crate::step::Step;

/// What a strategy gets to look at when picking the next step.
pub struct DecisionInput<'a> {
    pub current: &'a Arc<dyn Step>,
    /// Legal next steps in declaration order. Always more than one.
    pub candidates: &'a [Arc<dyn Step>],
    pub last_execution: Option<&'a StepExecution>,
}

/// Custom selection hook. Returns the id of the chosen candidate.
pub type DecisionFn = Arc<dyn Fn(&DecisionInput<'_>) -> Option<String> + Send + Sync>;

/// One way of resolving a branch.
#[derive(Clone)]
pub enum DecisionStrategy {
    /// Invoke the current step's decision tool; its output names the next step.
    DecisionTool,
    /// Follow the `next_step` attached to the model's last response.
    ModelSuggestion,
    /// Take the first candidate in declaration order.
    FirstCandidate,
    Custom(DecisionFn),
}

impl DecisionStrategy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&DecisionInput<'_>) -> Option<String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }
}

impl fmt::Debug for DecisionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecisionTool => f.write_str("DecisionTool"),
            Self::ModelSuggestion => f.write_str("ModelSuggestion"),
            Self::FirstCandidate => f.write_str("FirstCandidate"),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Ordered strategies for choosing among several legal next steps.
///
/// Strategies run in order; the first one that names a candidate wins.
/// A strategy that errors or names a non-candidate yields to the next one.
#[derive(Debug, Clone)]
pub struct NextStepDecisionChain {
    strategies: Vec<DecisionStrategy>,
}

impl Default for NextStepDecisionChain {
    fn default() -> Self {
        Self::new(vec![
            DecisionStrategy::DecisionTool,
            DecisionStrategy::ModelSuggestion,
            DecisionStrategy::FirstCandidate,
        ])
    }
}

impl NextStepDecisionChain {
    pub fn new(strategies: Vec<DecisionStrategy>) -> Self {
        Self { strategies }
    }

    pub fn strategies(&self) -> &[DecisionStrategy] {
        &self.strategies
    }

    pub async fn decide(
        &self,
        input: &DecisionInput<'_>,
        ctx: &AgentContext,
    ) -> Result<Option<Arc<dyn Step>>> {
        for strategy in &self.strategies {
            let choice = match strategy {
                DecisionStrategy::DecisionTool => self.ask_decision_tool(input, ctx).await?,
                DecisionStrategy::ModelSuggestion => input
                    .last_execution
                    .and_then(StepExecution::last_response)
                    .and_then(|r| r.completion.as_ref())
                    .and_then(|c| c.next_step.clone()),
                DecisionStrategy::FirstCandidate => {
                    input.candidates.first().map(|s| s.id().to_string())
                }
                DecisionStrategy::Custom(f) => f(input),
            };

            let Some(choice) = choice else {
                continue;
            };
            match find_candidate(input.candidates, &choice) {
                Some(step) => {
                    debug!(
                        from = %input.current.id(),
                        to = %step.id(),
                        strategy = ?strategy,
                        "Resolved next step"
                    );
                    return Ok(Some(step));
                }
                None => warn!(
                    from = %input.current.id(),
                    choice = %choice,
                    strategy = ?strategy,
                    "Decision named a step that is not a legal candidate"
                ),
            }
        }
        Ok(None)
    }

    /// Run the decision tool once. Only cancellation is propagated; any
    /// other failure lets the next strategy decide.
    async fn ask_decision_tool(
        &self,
        input: &DecisionInput<'_>,
        ctx: &AgentContext,
    ) -> Result<Option<String>> {
        let Some(template) = input.current.decision_tool_call() else {
            return Ok(None);
        };
        let call = template.fresh();
        let tool_ctx = ToolContext {
            conversation_id: ctx.conversation_id.clone(),
            step_id: input.current.id().to_string(),
            attempt: 1,
        };
        let what = format!("decision tool {}", call.name);
        let outcome = retry::guarded(
            &ctx.cancel,
            ctx.config.tool_call_timeout(),
            &what,
            ctx.tools.execute(&call, tool_ctx),
        )
        .await;

        match outcome {
            Ok(result) if !result.is_error => Ok(Some(result.content)),
            Ok(result) => {
                warn!(tool = %call.name, error = %result.content, "Decision tool reported an error");
                Ok(None)
            }
            Err(WaypointError::Cancelled) => Err(WaypointError::Cancelled),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Decision tool failed");
                Ok(None)
            }
        }
    }
}

fn find_candidate(candidates: &[Arc<dyn Step>], choice: &str) -> Option<Arc<dyn Step>> {
    let choice = choice.trim().trim_matches('"').trim();
    candidates.iter().find(|s| s.id() == choice).cloned()
}
