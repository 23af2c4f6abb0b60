use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Model backend. One request/response round-trip per call.
///
/// Implementations may fail; the step executor owns retry and memory
/// checkpointing around every call.
pub trait ModelCallExecutor: Send + Sync + 'static {
    fn execute(&self, request: ModelCallRequest) -> BoxFuture<'_, Result<ModelCallResponse>>;
}

/// Tool backend, dispatching a tool call by name.
///
/// Returning `Ok` with [`ToolResult::is_error`] set counts as a failed
/// attempt, the same as returning `Err`.
pub trait ToolCallExecutor: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        call: &'a ToolCall,
        ctx: ToolContext,
    ) -> BoxFuture<'a, Result<ToolResult>>;
}

/// Conversation memory with versioned snapshots.
///
/// Snapshot and restore are serialized per conversation id; restoring a
/// snapshot brings back exactly the messages present when it was taken.
pub trait ModelMemory: Send + Sync + 'static {
    /// Policy-filtered history used to assemble a prompt.
    fn prompt_messages(&self, conversation: &ConversationId) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;

    /// Append messages to a conversation.
    fn save_all(
        &self,
        conversation: &ConversationId,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Save the current state of a conversation.
    fn take_snapshot(&self, conversation: &ConversationId) -> BoxFuture<'_, Result<SnapshotId>>;

    /// Roll a conversation back to a previously taken snapshot.
    fn restore_snapshot(
        &self,
        conversation: &ConversationId,
        snapshot: SnapshotId,
    ) -> BoxFuture<'_, Result<()>>;

    /// Drop a snapshot that is no longer needed.
    fn release_snapshot(
        &self,
        conversation: &ConversationId,
        snapshot: SnapshotId,
    ) -> BoxFuture<'_, Result<()>> {
        let _ = (conversation, snapshot);
        Box::pin(async { Ok(()) })
    }
}
