use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::ModelMemory;
use waypoint_core::types::{ChatMessage, ConversationId, Role, SnapshotId};

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<ChatMessage>,
    snapshots: BTreeMap<SnapshotId, Vec<ChatMessage>>,
}

/// Process-local conversation memory.
///
/// Each conversation sits behind its own async lock, so snapshot and
/// restore on one conversation never interleave while other conversations
/// proceed independently.
#[derive(Debug, Default)]
pub struct InMemoryModelMemory {
    conversations: Mutex<HashMap<ConversationId, Arc<AsyncMutex<Conversation>>>>,
    next_snapshot: AtomicU64,
    max_prompt_messages: Option<usize>,
}

impl InMemoryModelMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the most recent `max` non-system messages go into prompts.
    /// System messages are always kept.
    pub fn with_max_prompt_messages(mut self, max: usize) -> Self {
        self.max_prompt_messages = Some(max);
        self
    }

    fn conversation(&self, id: &ConversationId) -> Result<Arc<AsyncMutex<Conversation>>> {
        let mut map = self
            .conversations
            .lock()
            .map_err(|e| WaypointError::Memory(e.to_string()))?;
        Ok(map.entry(id.clone()).or_default().clone())
    }

    /// Full, unfiltered history of a conversation.
    pub async fn messages(&self, id: &ConversationId) -> Result<Vec<ChatMessage>> {
        let conv = self.conversation(id)?;
        let guard = conv.lock().await;
        Ok(guard.messages.clone())
    }

    /// Snapshots currently held for a conversation.
    pub async fn snapshot_count(&self, id: &ConversationId) -> Result<usize> {
        let conv = self.conversation(id)?;
        let guard = conv.lock().await;
        Ok(guard.snapshots.len())
    }

    fn apply_prompt_policy(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let Some(max) = self.max_prompt_messages else {
            return messages;
        };
        let others = messages.iter().filter(|m| m.role != Role::System).count();
        let mut skip = others.saturating_sub(max);
        messages
            .into_iter()
            .filter(|m| {
                if m.role == Role::System || skip == 0 {
                    return true;
                }
                skip -= 1;
                false
            })
            .collect()
    }
}

impl ModelMemory for InMemoryModelMemory {
    fn prompt_messages(&self, conversation: &ConversationId) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let id = conversation.clone();
        Box::pin(async move {
            let messages = self.messages(&id).await?;
            Ok(self.apply_prompt_policy(messages))
        })
    }

    fn save_all(
        &self,
        conversation: &ConversationId,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<()>> {
        let id = conversation.clone();
        Box::pin(async move {
            let conv = self.conversation(&id)?;
            let mut guard = conv.lock().await;
            guard.messages.extend(messages);
            Ok(())
        })
    }

    fn take_snapshot(&self, conversation: &ConversationId) -> BoxFuture<'_, Result<SnapshotId>> {
        let id = conversation.clone();
        Box::pin(async move {
            let conv = self.conversation(&id)?;
            let mut guard = conv.lock().await;
            let snapshot = SnapshotId(self.next_snapshot.fetch_add(1, Ordering::Relaxed));
            let saved = guard.messages.clone();
            guard.snapshots.insert(snapshot, saved);
            debug!(conversation = %id, %snapshot, "Took memory snapshot");
            Ok(snapshot)
        })
    }

    fn restore_snapshot(
        &self,
        conversation: &ConversationId,
        snapshot: SnapshotId,
    ) -> BoxFuture<'_, Result<()>> {
        let id = conversation.clone();
        Box::pin(async move {
            let conv = self.conversation(&id)?;
            let mut guard = conv.lock().await;
            let saved = guard.snapshots.get(&snapshot).cloned().ok_or_else(|| {
                WaypointError::Memory(format!("unknown snapshot {snapshot} for conversation {id}"))
            })?;
            guard.messages = saved;
            debug!(conversation = %id, %snapshot, "Restored memory snapshot");
            Ok(())
        })
    }

    fn release_snapshot(
        &self,
        conversation: &ConversationId,
        snapshot: SnapshotId,
    ) -> BoxFuture<'_, Result<()>> {
        let id = conversation.clone();
        Box::pin(async move {
            let conv = self.conversation(&id)?;
            let mut guard = conv.lock().await;
            guard.snapshots.remove(&snapshot);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_restore_brings_back_snapshot_state() {
        let memory = InMemoryModelMemory::new();
        let conv = ConversationId::from_str("c1");
        memory
            .save_all(&conv, vec![ChatMessage::user("hello")])
            .await
            .unwrap();
        let snap = memory.take_snapshot(&conv).await.unwrap();
        memory
            .save_all(&conv, vec![ChatMessage::assistant_text("partial")])
            .await
            .unwrap();
        assert_eq!(memory.messages(&conv).await.unwrap().len(), 2);

        memory.restore_snapshot(&conv, snap).await.unwrap();
        let msgs = memory.messages(&conv).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text(), "hello");
    }

    #[tokio::test]
    async fn test_snapshot_can_be_restored_twice() {
        let memory = InMemoryModelMemory::new();
        let conv = ConversationId::from_str("c1");
        let snap = memory.take_snapshot(&conv).await.unwrap();
        for _ in 0..2 {
            memory
                .save_all(&conv, vec![ChatMessage::user("noise")])
                .await
                .unwrap();
            memory.restore_snapshot(&conv, snap).await.unwrap();
            assert!(memory.messages(&conv).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_release_and_unknown_snapshot() {
        let memory = InMemoryModelMemory::new();
        let conv = ConversationId::from_str("c1");
        let snap = memory.take_snapshot(&conv).await.unwrap();
        assert_eq!(memory.snapshot_count(&conv).await.unwrap(), 1);
        memory.release_snapshot(&conv, snap).await.unwrap();
        assert_eq!(memory.snapshot_count(&conv).await.unwrap(), 0);

        let err = memory.restore_snapshot(&conv, snap).await.unwrap_err();
        assert!(matches!(err, WaypointError::Memory(_)));
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let memory = InMemoryModelMemory::new();
        let a = ConversationId::from_str("a");
        let b = ConversationId::from_str("b");
        let snap = memory.take_snapshot(&a).await.unwrap();
        memory
            .save_all(&b, vec![ChatMessage::user("in b")])
            .await
            .unwrap();
        memory.restore_snapshot(&a, snap).await.unwrap();
        assert_eq!(memory.messages(&b).await.unwrap().len(), 1);
        // Snapshot ids are not valid across conversations.
        assert!(memory.restore_snapshot(&b, snap).await.is_err());
    }

    #[tokio::test]
    async fn test_prompt_window_keeps_system_messages() {
        let memory = InMemoryModelMemory::new().with_max_prompt_messages(2);
        let conv = ConversationId::from_str("c1");
        memory
            .save_all(
                &conv,
                vec![
                    ChatMessage::system("goal"),
                    ChatMessage::user("1"),
                    ChatMessage::assistant_text("2"),
                    ChatMessage::user("3"),
                ],
            )
            .await
            .unwrap();
        let prompt = memory.prompt_messages(&conv).await.unwrap();
        let texts: Vec<String> = prompt.iter().map(ChatMessage::text).collect();
        assert_eq!(texts, ["goal", "2", "3"]);
        assert_eq!(memory.messages(&conv).await.unwrap().len(), 4);
    }
}
