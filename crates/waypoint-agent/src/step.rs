use std::collections::HashMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use waypoint_core::types::{ChatMessage, ToolCall};

/// Fixed id of the goal identification step.
pub const GOAL_IDENTIFICATION_STEP_ID: &str = "goal_identification";

/// Which step variant a recipe entry builds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Model rounds with tool dispatch until a completion predicate fires.
    #[default]
    Tool,
    /// A single model round, no tools.
    Model,
    /// Extract the agent's goal from a user message.
    GoalIdentification,
}

/// A unit of workflow work.
///
/// Steps are immutable once the workflow is assembled. Each activation of a
/// step produces a fresh [`StepExecution`](crate::StepExecution).
pub trait Step: Send + Sync + Debug + 'static {
    /// Stable identifier, unique within a graph.
    fn id(&self) -> &str;

    fn kind(&self) -> StepKind;

    /// Tool names the model may request. An empty set means no tools; only
    /// the `final_answer` sentinel is always accepted.
    fn available_tools(&self) -> &[String] {
        &[]
    }

    fn goal(&self) -> Option<&ChatMessage> {
        None
    }

    fn system_prompt(&self) -> Option<&ChatMessage> {
        None
    }

    /// Tool call used to pick among several legal next steps.
    fn decision_tool_call(&self) -> Option<&ToolCall> {
        None
    }

    /// Step-level metadata; recognised execution keys override the run config.
    fn metadata(&self) -> Option<&HashMap<String, serde_json::Value>> {
        None
    }

    /// Messages this step appends to the conversation history for every
    /// model call.
    fn prompt_messages(&self) -> Vec<ChatMessage> {
        self.system_prompt()
            .into_iter()
            .chain(self.goal())
            .cloned()
            .collect()
    }

    /// Whether one successful model round finishes the step.
    fn completes_after_model_call(&self) -> bool {
        false
    }
}

/// General-purpose step: goal, system prompt, tools, optional decision tool.
#[derive(Debug, Clone)]
pub struct ToolStep {
    id: String,
    goal: Option<ChatMessage>,
    system_prompt: Option<ChatMessage>,
    tools: Vec<String>,
    decision_tool: Option<ToolCall>,
    metadata: HashMap<String, serde_json::Value>,
}

impl ToolStep {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal: None,
            system_prompt: None,
            tools: Vec::new(),
            decision_tool: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(ChatMessage::user(goal));
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(ChatMessage::system(prompt));
        self
    }

    /// Set the allowed tools. Duplicates are dropped, first occurrence wins.
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.clear();
        for tool in tools {
            let tool = tool.into();
            if !self.tools.contains(&tool) {
                self.tools.push(tool);
            }
        }
        self
    }

    pub fn with_decision_tool(mut self, name: impl Into<String>, input: serde_json::Value) -> Self {
        self.decision_tool = Some(ToolCall::new(name, input));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl Step for ToolStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::Tool
    }

    fn available_tools(&self) -> &[String] {
        &self.tools
    }

    fn goal(&self) -> Option<&ChatMessage> {
        self.goal.as_ref()
    }

    fn system_prompt(&self) -> Option<&ChatMessage> {
        self.system_prompt.as_ref()
    }

    fn decision_tool_call(&self) -> Option<&ToolCall> {
        self.decision_tool.as_ref()
    }

    fn metadata(&self) -> Option<&HashMap<String, serde_json::Value>> {
        Some(&self.metadata)
    }
}

/// Model-only step: one round and no tools.
#[derive(Debug, Clone)]
pub struct ModelStep {
    id: String,
    goal: Option<ChatMessage>,
    system_prompt: Option<ChatMessage>,
    decision_tool: Option<ToolCall>,
    metadata: HashMap<String, serde_json::Value>,
}

impl ModelStep {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal: None,
            system_prompt: None,
            decision_tool: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(ChatMessage::user(goal));
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(ChatMessage::system(prompt));
        self
    }

    pub fn with_decision_tool(mut self, name: impl Into<String>, input: serde_json::Value) -> Self {
        self.decision_tool = Some(ToolCall::new(name, input));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl Step for ModelStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::Model
    }

    fn goal(&self) -> Option<&ChatMessage> {
        self.goal.as_ref()
    }

    fn system_prompt(&self) -> Option<&ChatMessage> {
        self.system_prompt.as_ref()
    }

    fn decision_tool_call(&self) -> Option<&ToolCall> {
        self.decision_tool.as_ref()
    }

    fn metadata(&self) -> Option<&HashMap<String, serde_json::Value>> {
        Some(&self.metadata)
    }

    fn completes_after_model_call(&self) -> bool {
        true
    }
}

/// Identifies the agent's goal from the user's opening message.
#[derive(Debug, Clone)]
pub struct GoalIdentificationStep {
    id: String,
    goal: ChatMessage,
    system_prompt: ChatMessage,
    user_message: ChatMessage,
}

impl GoalIdentificationStep {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            id: GOAL_IDENTIFICATION_STEP_ID.to_string(),
            goal: ChatMessage::user("Identify the agent's goal from the user message."),
            system_prompt: ChatMessage::system(
                "You are an agent responsible for working out what your goal is.",
            ),
            user_message: ChatMessage::user(user_message),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

impl Step for GoalIdentificationStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StepKind {
        StepKind::GoalIdentification
    }

    fn goal(&self) -> Option<&ChatMessage> {
        Some(&self.goal)
    }

    fn system_prompt(&self) -> Option<&ChatMessage> {
        Some(&self.system_prompt)
    }

    fn prompt_messages(&self) -> Vec<ChatMessage> {
        vec![
            self.system_prompt.clone(),
            self.goal.clone(),
            self.user_message.clone(),
        ]
    }

    fn completes_after_model_call(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::types::Role;

    #[test]
    fn test_tool_step_builder() {
        let step = ToolStep::new("research")
            .with_goal("Find three sources.")
            .with_system_prompt("You are a researcher.")
            .with_tools(["search", "fetch", "search"])
            .with_decision_tool("router", serde_json::json!({"question": "next?"}))
            .with_metadata("maxModelCallsPerStep", serde_json::json!(4));

        assert_eq!(step.id(), "research");
        assert_eq!(step.kind(), StepKind::Tool);
        assert_eq!(step.available_tools(), ["search", "fetch"]);
        assert_eq!(step.decision_tool_call().unwrap().name, "router");
        assert_eq!(
            step.metadata().unwrap().get("maxModelCallsPerStep"),
            Some(&serde_json::json!(4))
        );
        assert!(!step.completes_after_model_call());
    }

    #[test]
    fn test_prompt_messages_system_then_goal() {
        let step = ToolStep::new("s")
            .with_goal("do the thing")
            .with_system_prompt("be brief");
        let msgs = step.prompt_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].text(), "do the thing");
    }

    #[test]
    fn test_model_step_completes_after_one_round() {
        let step = ModelStep::new("summarize").with_goal("Summarize.");
        assert!(step.completes_after_model_call());
        assert!(step.available_tools().is_empty());
        assert_eq!(step.prompt_messages().len(), 1);
    }

    #[test]
    fn test_goal_identification_includes_user_message() {
        let step = GoalIdentificationStep::new("book me a flight to Lisbon");
        assert_eq!(step.id(), GOAL_IDENTIFICATION_STEP_ID);
        let msgs = step.prompt_messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[2].text(), "book me a flight to Lisbon");
        assert!(step.completes_after_model_call());
    }
}
