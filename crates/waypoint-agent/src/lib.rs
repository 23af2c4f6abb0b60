pub mod agent_executor;
pub mod completion;
pub mod context;
pub mod decision;
pub mod execution;
pub mod graph;
pub mod manager;
pub mod memory;
pub mod recipe;
pub mod retry;
pub mod step;
pub mod step_executor;

pub use agent_executor::{AgentExecutor, AgentResult};
pub use completion::{CompletionOutcome, CompletionVerdict, StepCompletionChain};
pub use context::AgentContext;
pub use decision::{DecisionInput, DecisionStrategy, NextStepDecisionChain};
pub use execution::{StepExecution, FINAL_ANSWER_TOOL};
pub use graph::StepGraph;
pub use manager::StepManager;
pub use memory::InMemoryModelMemory;
pub use recipe::{Recipe, StepDefinition};
pub use step::{GoalIdentificationStep, ModelStep, Step, StepKind, ToolStep, GOAL_IDENTIFICATION_STEP_ID};
pub use step_executor::StepExecutor;
