use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use waypoint_core::types::{
    CompletionInstruction, ModelCall, ModelCallResponse, StepStatus, ToolCall,
};

use crate::step::Step;

/// Name of the sentinel tool a model calls to hand in its final answer.
pub const FINAL_ANSWER_TOOL: &str = "final_answer";

pub(crate) fn is_final_answer(name: &str) -> bool {
    name.eq_ignore_ascii_case(FINAL_ANSWER_TOOL)
}

/// Ledger of one step activation.
///
/// Model and tool calls are only ever appended, and the status leaves
/// `IN_PROGRESS` exactly once. Appends after finalization are dropped.
#[derive(Debug, Clone)]
pub struct StepExecution {
    id: String,
    step: Arc<dyn Step>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    status: StepStatus,
    model_calls: Vec<ModelCall>,
    tool_calls: Vec<ToolCall>,
    completion_result: Option<CompletionInstruction>,
    error: Option<String>,
}

impl StepExecution {
    pub fn new(step: Arc<dyn Step>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            step,
            started_at: Utc::now(),
            completed_at: None,
            status: StepStatus::InProgress,
            model_calls: Vec::new(),
            tool_calls: Vec::new(),
            completion_result: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }

    pub fn step_id(&self) -> &str {
        self.step.id()
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn model_calls(&self) -> &[ModelCall] {
        &self.model_calls
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn completion_result(&self) -> Option<&CompletionInstruction> {
        self.completion_result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn push_model_call(&mut self, call: ModelCall) -> bool {
        if self.reject_append("model call") {
            return false;
        }
        self.model_calls.push(call);
        true
    }

    pub fn extend_tool_calls(&mut self, calls: impl IntoIterator<Item = ToolCall>) -> bool {
        if self.reject_append("tool calls") {
            return false;
        }
        self.tool_calls.extend(calls);
        true
    }

    /// Keep the latest completion instruction the model sent.
    pub fn set_completion_result(&mut self, instruction: CompletionInstruction) {
        if self.reject_append("completion result") {
            return;
        }
        self.completion_result = Some(instruction);
    }

    pub fn complete(&mut self) -> bool {
        self.finalize(StepStatus::Completed, None)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        self.finalize(StepStatus::Failed, Some(reason.into()))
    }

    pub fn skip(&mut self) -> bool {
        self.finalize(StepStatus::Skipped, None)
    }

    fn finalize(&mut self, status: StepStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            warn!(
                step = %self.step_id(),
                current = %self.status,
                requested = %status,
                "Ignoring second finalization of step execution"
            );
            return false;
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }

    fn reject_append(&self, what: &str) -> bool {
        if self.status.is_terminal() {
            warn!(step = %self.step_id(), what, "Dropping append to finalized step execution");
            return true;
        }
        false
    }

    /// Whether the model asked for the final-answer sentinel tool.
    pub fn final_answer_requested(&self) -> bool {
        self.tool_calls.iter().any(|c| is_final_answer(&c.name))
    }

    /// Finalized, or the model has already handed in a final answer.
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal() || self.final_answer_requested()
    }

    /// True while the step is open and still has model-call budget left.
    pub fn requires_more_calls(&self, max_model_calls: usize) -> bool {
        !self.is_complete() && self.model_calls.len() < max_model_calls
    }

    pub fn last_response(&self) -> Option<&ModelCallResponse> {
        self.model_calls.iter().rev().find_map(|c| c.response.as_ref())
    }

    /// Final answer if one was given, otherwise the last model text.
    pub fn output(&self) -> Option<String> {
        let answer = self
            .tool_calls
            .iter()
            .rev()
            .filter(|c| is_final_answer(&c.name))
            .find_map(|c| c.response.as_ref())
            .map(|r| r.content.clone());
        answer.or_else(|| self.last_response().map(ModelCallResponse::output_text))
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::ToolStep;
    use waypoint_core::types::{ModelCallRequest, ToolResult};

    fn execution() -> StepExecution {
        StepExecution::new(Arc::new(ToolStep::new("draft")))
    }

    fn completed_call(response: ModelCallResponse) -> ModelCall {
        let mut call = ModelCall::new(ModelCallRequest::default());
        call.complete(response, 1);
        call
    }

    #[test]
    fn test_new_execution_in_progress() {
        let exec = execution();
        assert_eq!(exec.status(), StepStatus::InProgress);
        assert_eq!(exec.step_id(), "draft");
        assert!(exec.completed_at().is_none());
        assert!(exec.requires_more_calls(1));
    }

    #[test]
    fn test_status_set_once() {
        let mut exec = execution();
        assert!(exec.complete());
        assert!(!exec.fail("too late"));
        assert!(!exec.skip());
        assert_eq!(exec.status(), StepStatus::Completed);
        assert!(exec.error().is_none());
        assert!(exec.completed_at().is_some());
    }

    #[test]
    fn test_appends_dropped_after_finalization() {
        let mut exec = execution();
        assert!(exec.push_model_call(completed_call(ModelCallResponse::text("a"))));
        exec.fail("budget");
        assert!(!exec.push_model_call(completed_call(ModelCallResponse::text("b"))));
        assert!(!exec.extend_tool_calls(vec![ToolCall::new("search", serde_json::Value::Null)]));
        assert_eq!(exec.model_calls().len(), 1);
        assert!(exec.tool_calls().is_empty());
        assert_eq!(exec.error(), Some("budget"));
    }

    #[test]
    fn test_requires_more_calls_respects_budget() {
        let mut exec = execution();
        exec.push_model_call(completed_call(ModelCallResponse::text("a")));
        assert!(exec.requires_more_calls(2));
        exec.push_model_call(completed_call(ModelCallResponse::text("b")));
        assert!(!exec.requires_more_calls(2));
    }

    #[test]
    fn test_final_answer_marks_complete_and_is_output() {
        let mut exec = execution();
        exec.push_model_call(completed_call(ModelCallResponse::text("thinking")));
        let mut answer = ToolCall::new("Final_Answer", serde_json::json!({"answer": "42"}));
        answer.complete(ToolResult::success("42"));
        exec.extend_tool_calls(vec![answer]);

        assert!(exec.final_answer_requested());
        assert!(exec.is_complete());
        assert!(!exec.requires_more_calls(10));
        assert_eq!(exec.output().as_deref(), Some("42"));
    }

    #[test]
    fn test_output_falls_back_to_model_text() {
        let mut exec = execution();
        exec.push_model_call(completed_call(ModelCallResponse::text("first")));
        exec.push_model_call(completed_call(ModelCallResponse::text("second")));
        assert_eq!(exec.output().as_deref(), Some("second"));
    }
}
