use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::{
    sort_messages, ChangeEvent, ChatError, ConversationId, ConversationMetadata, Message,
    NewMessage,
};

/// Capacity of the in-process change feed; slower subscribers see `Lagged` and resync.
pub const CHANGE_FEED_CAPACITY: usize = 1024;

/// The realtime document store holding conversations.
///
/// Every method is a single logical write or read: implementations must make
/// `commit_send` and `mark_read` visible all at once, and must only publish a
/// [`ChangeEvent`] after the data it announces is readable.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Appends the message and upserts the conversation metadata in one write.
    ///
    /// The receiver's unread counter is incremented in place, never
    /// read-modified-written by the caller.
    async fn commit_send(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, ChatError>;

    /// Flags every unread message addressed to `reader_id` as read and zeroes
    /// the reader's unread counter. Returns how many messages flipped.
    /// A missing conversation is not an error.
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
    ) -> Result<usize, ChatError>;

    /// All messages of the conversation ordered by timestamp, then insertion.
    async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, ChatError>;

    async fn metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationMetadata>, ChatError>;

    /// Metadata of every conversation `participant` takes part in, in no particular order.
    async fn conversations_for(
        &self,
        participant: &str,
    ) -> Result<Vec<ConversationMetadata>, ChatError>;

    /// Stores fed by an external notification channel report its loss with
    /// [`ChangeEvent::Interrupted`] and its return with [`ChangeEvent::Resync`].
    fn changes(&self) -> broadcast::Receiver<ChangeEvent>;
}

#[derive(Default)]
struct StoredConversation {
    metadata: Option<ConversationMetadata>,
    messages: Vec<Message>,
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, StoredConversation>,
    next_sequence: u64,
}

/// In-process store; one lock per call makes every write atomic.
pub struct MemoryChatStore {
    state: Mutex<MemoryState>,
    feed: broadcast::Sender<ChangeEvent>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            feed,
        }
    }

    fn publish(&self, conversation_id: &ConversationId) {
        // No live receivers is fine: nobody is listening yet
        let _ = self.feed.send(ChangeEvent::Conversation(conversation_id.clone()));
    }
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn commit_send(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, ChatError> {
        let stored = {
            let mut state = self.state.lock().await;
            state.next_sequence += 1;
            let sequence = state.next_sequence;

            let conversation = state
                .conversations
                .entry(conversation_id.clone())
                .or_default();

            let message = message.into_message(conversation_id.clone(), sequence);

            let metadata = conversation.metadata.get_or_insert_with(|| {
                ConversationMetadata::new(
                    conversation_id.clone(),
                    &message.sender_id,
                    &message.receiver_id,
                )
            });
            metadata.last_activity = metadata.last_activity.max(message.timestamp);
            metadata.last_message = Some(message.content.clone());
            *metadata
                .unread_count
                .entry(message.receiver_id.clone())
                .or_insert(0) += 1;

            conversation.messages.push(message.clone());
            message
        };

        debug!("Stored message {} in {}", stored.id, conversation_id.path().metadata());
        self.publish(conversation_id);
        Ok(stored)
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
    ) -> Result<usize, ChatError> {
        let (flipped, changed) = {
            let mut state = self.state.lock().await;
            let Some(conversation) = state.conversations.get_mut(conversation_id) else {
                return Ok(0);
            };

            let mut flipped = 0;
            for message in conversation.messages.iter_mut() {
                if message.is_unread_for(reader_id) {
                    message.read = true;
                    flipped += 1;
                }
            }

            let mut counter_reset = false;
            if let Some(metadata) = conversation.metadata.as_mut() {
                if let Some(count) = metadata.unread_count.get_mut(reader_id) {
                    counter_reset = *count != 0;
                    *count = 0;
                }
            }

            (flipped, flipped > 0 || counter_reset)
        };

        if changed {
            self.publish(conversation_id);
        }
        Ok(flipped)
    }

    async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, ChatError> {
        let state = self.state.lock().await;
        let mut messages = state
            .conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default();
        sort_messages(&mut messages);
        Ok(messages)
    }

    async fn metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationMetadata>, ChatError> {
        let state = self.state.lock().await;
        Ok(state
            .conversations
            .get(conversation_id)
            .and_then(|c| c.metadata.clone()))
    }

    async fn conversations_for(
        &self,
        participant: &str,
    ) -> Result<Vec<ConversationMetadata>, ChatError> {
        let state = self.state.lock().await;
        Ok(state
            .conversations
            .values()
            .filter_map(|c| c.metadata.as_ref())
            .filter(|m| m.has_participant(participant))
            .cloned()
            .collect())
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageType, SenderRole};

    fn new_message(id: &str, from: &str, to: &str, timestamp: i64) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            content: format!("message {}", id),
            timestamp,
            message_type: MessageType::Text,
            sender_name: from.to_string(),
            sender_role: SenderRole::Patient,
        }
    }

    #[tokio::test]
    async fn test_commit_send_updates_metadata_and_publishes() {
        let store = MemoryChatStore::new();
        let mut changes = store.changes();
        let id = ConversationId::for_pair("a", "b");

        let stored = store.commit_send(&id, new_message("m1", "a", "b", 100)).await.unwrap();
        assert_eq!(stored.sequence, 1);
        assert!(!stored.read);

        let meta = store.metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.unread_for("b"), 1);
        assert_eq!(meta.unread_for("a"), 0);
        assert_eq!(meta.last_activity, 100);
        assert_eq!(meta.last_message.as_deref(), Some("message m1"));

        assert_eq!(changes.recv().await.unwrap(), ChangeEvent::Conversation(id));
    }

    #[tokio::test]
    async fn test_mark_read_missing_conversation_is_noop() {
        let store = MemoryChatStore::new();
        let id = ConversationId::for_pair("a", "b");
        assert_eq!(store.mark_read(&id, "a").await.unwrap(), 0);
        assert!(store.metadata(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_read_only_flips_messages_for_reader() {
        let store = MemoryChatStore::new();
        let id = ConversationId::for_pair("a", "b");
        store.commit_send(&id, new_message("m1", "a", "b", 1)).await.unwrap();
        store.commit_send(&id, new_message("m2", "b", "a", 2)).await.unwrap();

        assert_eq!(store.mark_read(&id, "b").await.unwrap(), 1);

        let messages = store.messages(&id).await.unwrap();
        assert!(messages[0].read);
        assert!(!messages[1].read);

        let meta = store.metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.unread_for("b"), 0);
        assert_eq!(meta.unread_for("a"), 1);
    }

    #[tokio::test]
    async fn test_repeated_mark_read_publishes_nothing() {
        let store = MemoryChatStore::new();
        let id = ConversationId::for_pair("a", "b");
        store.commit_send(&id, new_message("m1", "a", "b", 1)).await.unwrap();
        store.mark_read(&id, "b").await.unwrap();

        let mut changes = store.changes();
        assert_eq!(store.mark_read(&id, "b").await.unwrap(), 0);
        assert!(matches!(
            changes.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_conversations_for_filters_participant() {
        let store = MemoryChatStore::new();
        let ab = ConversationId::for_pair("a", "b");
        let cd = ConversationId::for_pair("c", "d");
        store.commit_send(&ab, new_message("m1", "a", "b", 1)).await.unwrap();
        store.commit_send(&cd, new_message("m2", "c", "d", 2)).await.unwrap();

        let for_a = store.conversations_for("a").await.unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].conversation_id, ab);
        assert!(store.conversations_for("z").await.unwrap().is_empty());
    }
}
