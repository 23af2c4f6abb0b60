use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversation identifier used to key model memory.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one saved version of a conversation's memory.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "snap-{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    fn with_text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
            timestamp: Some(Utc::now()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_text(Role::User, text)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::with_text(Role::Assistant, text)
    }

    /// Collect tool results into one tool-role message.
    pub fn tool_results(calls: &[ToolCall]) -> Self {
        Self {
            role: Role::Tool,
            content: calls.iter().map(ToolCall::result_block).collect(),
            timestamp: Some(Utc::now()),
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Status of a tool call or of one of its attempts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// One try at executing a logical tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallAttempt {
    /// 1-based attempt number.
    pub number: u32,
    pub status: ToolCallStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

fn new_call_id() -> String {
    Uuid::new_v4().to_string()
}

/// A tool invocation requested by the model.
///
/// The logical call leaves `Pending` exactly once; every retry is recorded
/// as a separate [`ToolCallAttempt`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default = "new_call_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub status: ToolCallStatus,
    #[serde(default)]
    pub response: Option<ToolResult>,
    #[serde(default)]
    pub attempts: Vec<ToolCallAttempt>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: new_call_id(),
            name: name.into(),
            input,
            status: ToolCallStatus::Pending,
            response: None,
            attempts: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ToolCallStatus::Pending
    }

    /// A copy of this call with a fresh id and no recorded outcome.
    pub fn fresh(&self) -> Self {
        Self::new(self.name.clone(), self.input.clone())
    }

    pub fn record_attempt(&mut self, attempt: ToolCallAttempt) {
        self.attempts.push(attempt);
    }

    /// Mark the call completed. Returns false if it already left `Pending`.
    pub fn complete(&mut self, result: ToolResult) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ToolCallStatus::Completed;
        self.response = Some(result);
        true
    }

    /// Mark the call failed, keeping the error as its response payload.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ToolCallStatus::Failed;
        self.response = Some(ToolResult::error(error));
        true
    }

    /// Content block fed back to the model for this call.
    pub fn result_block(&self) -> ContentBlock {
        let (content, is_error) = match &self.response {
            Some(r) => (r.content.clone(), r.is_error),
            None => ("tool call produced no result".to_string(), true),
        };
        ContentBlock::ToolResult {
            tool_use_id: self.id.clone(),
            content,
            is_error,
        }
    }

    pub fn use_block(&self) -> ContentBlock {
        ContentBlock::ToolUse {
            id: self.id.clone(),
            name: self.name.clone(),
            input: self.input.clone(),
        }
    }
}

/// Context passed to tool executors.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
    pub step_id: String,
    /// 1-based attempt number of the current try.
    pub attempt: u32,
}

/// How the model wants the current step activation to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    Completed,
    CanNotFinish,
    UnrecoverableError,
    Skipped,
    AwaitingToolResults,
    Continue,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::CanNotFinish => "CAN_NOT_FINISH",
            Self::UnrecoverableError => "UNRECOVERABLE_ERROR",
            Self::Skipped => "SKIPPED",
            Self::AwaitingToolResults => "AWAITING_TOOL_RESULTS",
            Self::Continue => "CONTINUE",
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured completion signal the model may attach to its response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionInstruction {
    /// Shorthand for `outcome: COMPLETED`.
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub outcome: Option<StepOutcome>,
    /// Why the step cannot finish, or why it was skipped.
    #[serde(default)]
    pub reason: Option<String>,
    /// Suggested next step id, used when the graph branches.
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl CompletionInstruction {
    pub fn with_outcome(outcome: StepOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Default::default()
        }
    }

    /// An explicit `outcome` wins over `done`.
    pub fn effective_outcome(&self) -> Option<StepOutcome> {
        self.outcome.or(self.done.then_some(StepOutcome::Completed))
    }
}

/// Request for one model round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCallRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Names of the tools the model may request in this round.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// What the model produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCallResponse {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub completion: Option<CompletionInstruction>,
}

impl ModelCallResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::assistant_text(text)],
            ..Default::default()
        }
    }

    pub fn with_tool_call(mut self, name: impl Into<String>, input: serde_json::Value) -> Self {
        self.tool_calls.push(ToolCall::new(name, input));
        self
    }

    pub fn with_completion(mut self, completion: CompletionInstruction) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Assistant message to persist, with tool-use blocks appended.
    pub fn assistant_message(&self) -> ChatMessage {
        let mut content: Vec<ContentBlock> = self
            .messages
            .iter()
            .flat_map(|m| m.content.iter().cloned())
            .collect();
        content.extend(self.tool_calls.iter().map(ToolCall::use_block));
        ChatMessage {
            role: Role::Assistant,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn output_text(&self) -> String {
        self.messages
            .iter()
            .map(ChatMessage::text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelCallStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// Record of one model round-trip within a step activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCall {
    pub id: String,
    pub request: ModelCallRequest,
    pub status: ModelCallStatus,
    pub response: Option<ModelCallResponse>,
    pub error: Option<String>,
    /// Number of attempts spent, including the successful one.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ModelCall {
    pub fn new(request: ModelCallRequest) -> Self {
        Self {
            id: new_call_id(),
            request,
            status: ModelCallStatus::Pending,
            response: None,
            error: None,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn complete(&mut self, response: ModelCallResponse, attempts: u32) {
        self.status = ModelCallStatus::Completed;
        self.response = Some(response);
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>, attempts: u32) {
        self.status = ModelCallStatus::Failed;
        self.error = Some(error.into());
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
    }
}

/// Lifecycle status of one step activation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Event broadcast to all workflow subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Workflow run started.
    WorkflowStarted { conversation_id: ConversationId },
    /// A step activation began.
    StepStarted { step_id: String, activation: usize },
    /// A model round-trip finished.
    ModelCallFinished {
        step_id: String,
        call_index: usize,
        tool_calls: usize,
    },
    /// A model call attempt failed and will be retried.
    ModelCallRetry {
        step_id: String,
        attempt: u32,
        error: String,
    },
    /// Tool execution started.
    ToolStart { step_id: String, name: String },
    /// A tool attempt failed and will be retried.
    ToolRetry {
        step_id: String,
        name: String,
        attempt: u32,
        error: String,
    },
    /// Tool execution settled.
    ToolEnd {
        step_id: String,
        name: String,
        status: ToolCallStatus,
    },
    /// A step activation was finalized.
    StepFinished {
        step_id: String,
        status: StepStatus,
        model_calls: usize,
        tool_calls: usize,
    },
    /// The graph chose the next step.
    NextStepChosen { from: String, to: String },
    /// Workflow finished without a fatal error.
    WorkflowComplete { activations: usize },
    /// Workflow aborted.
    WorkflowFailed { error: String },
}
