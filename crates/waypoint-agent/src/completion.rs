use std::fmt;
use std::sync::Arc;

use waypoint_core::types::StepOutcome;
use waypoint_core::WaypointError;

use crate::execution::StepExecution;

/// What a completion predicate decided about a step activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Complete,
    Fail(String),
    /// End the activation as SKIPPED. The workflow moves on as if it completed.
    Skip,
}

/// A predicate that fired, with the name it was registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionVerdict {
    pub predicate: String,
    pub outcome: CompletionOutcome,
}

/// Inspects an execution after a model round. `None` means "not my call".
pub type CompletionPredicate =
    Arc<dyn Fn(&StepExecution, usize) -> Option<CompletionOutcome> + Send + Sync>;

/// Ordered completion predicates. The first one that fires decides.
#[derive(Clone)]
pub struct StepCompletionChain {
    predicates: Vec<(String, CompletionPredicate)>,
}

impl StepCompletionChain {
    /// A chain with no predicates. Steps only stop on budget exhaustion.
    pub fn empty() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }

    /// Append a predicate after the existing ones.
    pub fn with_predicate<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&StepExecution, usize) -> Option<CompletionOutcome> + Send + Sync + 'static,
    {
        self.predicates.push((name.into(), Arc::new(predicate)));
        self
    }

    /// Insert a predicate ahead of the existing ones.
    pub fn with_leading_predicate<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&StepExecution, usize) -> Option<CompletionOutcome> + Send + Sync + 'static,
    {
        self.predicates.insert(0, (name.into(), Arc::new(predicate)));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.predicates.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn evaluate(&self, execution: &StepExecution, max_model_calls: usize) -> Option<CompletionVerdict> {
        self.predicates.iter().find_map(|(name, predicate)| {
            predicate(execution, max_model_calls).map(|outcome| CompletionVerdict {
                predicate: name.clone(),
                outcome,
            })
        })
    }
}

impl Default for StepCompletionChain {
    fn default() -> Self {
        Self::empty()
            .with_predicate("final_answer", final_answer_observed)
            .with_predicate("completion_instruction", completion_instructed)
            .with_predicate("single_model_call", single_model_call)
            .with_predicate("model_call_budget", model_call_budget_reached)
    }
}

impl fmt::Debug for StepCompletionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepCompletionChain")
            .field("predicates", &self.names())
            .finish()
    }
}

pub fn final_answer_observed(execution: &StepExecution, _max: usize) -> Option<CompletionOutcome> {
    execution
        .final_answer_requested()
        .then_some(CompletionOutcome::Complete)
}

/// Honour the outcome the model attached to its latest completion instruction.
pub fn completion_instructed(execution: &StepExecution, _max: usize) -> Option<CompletionOutcome> {
    let instruction = execution.completion_result()?;
    match instruction.effective_outcome()? {
        StepOutcome::Completed => Some(CompletionOutcome::Complete),
        StepOutcome::Skipped => Some(CompletionOutcome::Skip),
        outcome @ (StepOutcome::CanNotFinish | StepOutcome::UnrecoverableError) => {
            let reason = instruction.reason.as_deref().unwrap_or("no reason given");
            Some(CompletionOutcome::Fail(format!(
                "model ended step '{}' with {outcome}: {reason}",
                execution.step_id()
            )))
        }
        StepOutcome::AwaitingToolResults | StepOutcome::Continue => None,
    }
}

pub fn single_model_call(execution: &StepExecution, _max: usize) -> Option<CompletionOutcome> {
    (execution.step().completes_after_model_call() && !execution.model_calls().is_empty())
        .then_some(CompletionOutcome::Complete)
}

pub fn model_call_budget_reached(execution: &StepExecution, max: usize) -> Option<CompletionOutcome> {
    (execution.model_calls().len() >= max).then(|| {
        CompletionOutcome::Fail(
            WaypointError::BudgetExhausted {
                step: execution.step_id().to_string(),
                max_calls: max,
            }
            .to_string(),
        )
    })
}
