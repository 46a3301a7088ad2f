use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::services::store::ChatStore;
use crate::{
    ChatError, ConversationId, ConversationMetadata, Message, MessageType, NewMessage, SenderRole,
};

/// Senders tracked before entries behind the wall clock are dropped.
const CLOCK_PRUNE_THRESHOLD: usize = 1024;

/// Per-sender clock: wall time in milliseconds, bumped so one sender never repeats a value.
#[derive(Default)]
pub struct MessageClock {
    last: Mutex<HashMap<String, i64>>,
}

impl MessageClock {
    pub fn next(&self, sender_id: &str) -> i64 {
        self.next_at(sender_id, Utc::now().timestamp_millis())
    }

    pub fn tracked_senders(&self) -> usize {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn next_at(&self, sender_id: &str, now_ms: i64) -> i64 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.len() >= CLOCK_PRUNE_THRESHOLD {
            // A sender whose last value is behind `now_ms` gets `now_ms` either way
            last.retain(|_, previous| *previous >= now_ms);
        }
        let slot = last.entry(sender_id.to_string()).or_insert(i64::MIN);
        let timestamp = now_ms.max(slot.saturating_add(1));
        *slot = timestamp;
        timestamp
    }
}

/// Outgoing message as the caller describes it.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub sender_name: String,
    pub sender_role: SenderRole,
}

/// Reads and writes conversations in the chat store.
pub struct MessageStoreAdapter {
    store: Arc<dyn ChatStore>,
    clock: MessageClock,
}

impl MessageStoreAdapter {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            clock: MessageClock::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        sender_name: &str,
        sender_role: SenderRole,
    ) -> Result<String, ChatError> {
        self.send(
            conversation_id,
            OutgoingMessage {
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
                content: content.to_string(),
                message_type: MessageType::Text,
                sender_name: sender_name.to_string(),
                sender_role,
            },
        )
        .await
    }

    /// Appends a message and updates the conversation metadata in one store write.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        outgoing: OutgoingMessage,
    ) -> Result<String, ChatError> {
        if outgoing.content.trim().is_empty() {
            return Err(ChatError::Validation("message content must not be empty".to_string()));
        }
        ensure_pair(conversation_id, &outgoing.sender_id, &outgoing.receiver_id)?;

        let message = NewMessage {
            id: Uuid::new_v4().to_string(),
            timestamp: self.clock.next(&outgoing.sender_id),
            sender_id: outgoing.sender_id,
            receiver_id: outgoing.receiver_id,
            content: outgoing.content,
            message_type: outgoing.message_type,
            sender_name: outgoing.sender_name,
            sender_role: outgoing.sender_role,
        };

        let stored = self
            .store
            .commit_send(conversation_id, message)
            .await
            .map_err(into_write_error)?;

        info!(
            "Message {} sent in conversation {}",
            stored.id, conversation_id
        );
        Ok(stored.id)
    }

    /// Acknowledges everything `reader_id` has received from `other_id`.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
        other_id: &str,
    ) -> Result<(), ChatError> {
        ensure_pair(conversation_id, reader_id, other_id)?;

        let flipped = self
            .store
            .mark_read(conversation_id, reader_id)
            .await
            .map_err(into_write_error)?;

        debug!(
            "Marked {} messages read for {} in {}",
            flipped, reader_id, conversation_id
        );
        Ok(())
    }

    /// Conversations of `user_id`, most recently active first.
    pub async fn list_conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationMetadata>, ChatError> {
        let mut conversations = self.store.conversations_for(user_id).await?;
        conversations.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        Ok(conversations)
    }

    pub async fn conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationMetadata, ChatError> {
        self.store
            .metadata(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, ChatError> {
        self.store.messages(conversation_id).await
    }
}

fn ensure_pair(conversation_id: &ConversationId, a: &str, b: &str) -> Result<(), ChatError> {
    if a == b {
        return Err(ChatError::Validation(
            "sender and receiver must differ".to_string(),
        ));
    }
    if ConversationId::for_pair(a, b) != *conversation_id {
        return Err(ChatError::Validation(format!(
            "{} and {} are not the participants of {}",
            a, b, conversation_id
        )));
    }
    Ok(())
}

fn into_write_error(e: ChatError) -> ChatError {
    match e {
        ChatError::Write(_) | ChatError::Validation(_) => e,
        other => ChatError::Write(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryChatStore;
    use assert_matches::assert_matches;

    #[test]
    fn test_clock_is_strictly_increasing_per_sender() {
        let clock = MessageClock::default();
        assert_eq!(clock.next_at("a", 100), 100);
        assert_eq!(clock.next_at("a", 100), 101);
        assert_eq!(clock.next_at("a", 50), 102);
        assert_eq!(clock.next_at("b", 50), 50);
        assert_eq!(clock.next_at("a", 500), 500);
    }

    #[test]
    fn test_clock_forgets_senders_behind_wall_clock() {
        let clock = MessageClock::default();
        for i in 0..CLOCK_PRUNE_THRESHOLD {
            clock.next_at(&format!("sender-{}", i), 100);
        }
        // One sender ran ahead of the wall clock
        assert_eq!(clock.next_at("fast", 5_000), 5_000);

        assert_eq!(clock.next_at("late", 1_000), 1_000);
        assert_eq!(clock.tracked_senders(), 2);
        assert_eq!(clock.next_at("fast", 1_000), 5_001);
    }

    #[tokio::test]
    async fn test_send_rejects_blank_content() {
        let adapter = MessageStoreAdapter::new(Arc::new(MemoryChatStore::new()));
        let id = ConversationId::for_pair("a", "b");

        assert_matches!(
            adapter.send_message(&id, "a", "b", "   ", "A", SenderRole::Patient).await,
            Err(ChatError::Validation(_))
        );
    }

    #[tokio::test]
    async fn test_send_rejects_foreign_conversation() {
        let adapter = MessageStoreAdapter::new(Arc::new(MemoryChatStore::new()));
        let id = ConversationId::for_pair("a", "c");

        assert_matches!(
            adapter.send_message(&id, "a", "b", "hi", "A", SenderRole::Patient).await,
            Err(ChatError::Validation(_))
        );
    }

    #[tokio::test]
    async fn test_missing_conversation_is_not_found() {
        let adapter = MessageStoreAdapter::new(Arc::new(MemoryChatStore::new()));
        let id = ConversationId::for_pair("a", "b");

        assert_matches!(adapter.conversation(&id).await, Err(ChatError::NotFound(_)));
        assert!(adapter.mark_read(&id, "a", "b").await.is_ok());
        assert!(adapter.messages(&id).await.unwrap().is_empty());
    }
}
