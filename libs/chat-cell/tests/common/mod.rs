#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use chat_cell::{
    services::store::{ChatStore, MemoryChatStore, CHANGE_FEED_CAPACITY},
    ChangeEvent, ChatError, ConversationId, ConversationMetadata, Message, MessageType,
    NewMessage, SenderRole,
};

/// Memory store with a change feed the test controls: sends can be switched
/// to fail, and the feed can be interrupted and resumed like a dropped
/// pub/sub connection.
pub struct FlakyStore {
    inner: MemoryChatStore,
    feed: broadcast::Sender<ChangeEvent>,
    pub fail_sends: AtomicBool,
    pub send_attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: MemoryChatStore::new(),
            feed,
            fail_sends: AtomicBool::new(false),
            send_attempts: AtomicUsize::new(0),
        }
    }

    pub fn interrupt_feed(&self) {
        let _ = self
            .feed
            .send(ChangeEvent::Interrupted("connection reset".to_string()));
    }

    pub fn resume_feed(&self) {
        let _ = self.feed.send(ChangeEvent::Resync);
    }

    /// Writes a message without announcing it, as if the notification was
    /// lost while the feed was down.
    pub async fn commit_unannounced(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, ChatError> {
        self.inner.commit_send(conversation_id, message).await
    }
}

#[async_trait]
impl ChatStore for FlakyStore {
    async fn commit_send(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, ChatError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Write("store unavailable".to_string()));
        }
        let stored = self.inner.commit_send(conversation_id, message).await?;
        let _ = self
            .feed
            .send(ChangeEvent::Conversation(conversation_id.clone()));
        Ok(stored)
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
    ) -> Result<usize, ChatError> {
        let flipped = self.inner.mark_read(conversation_id, reader_id).await?;
        if flipped > 0 {
            let _ = self
                .feed
                .send(ChangeEvent::Conversation(conversation_id.clone()));
        }
        Ok(flipped)
    }

    async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, ChatError> {
        self.inner.messages(conversation_id).await
    }

    async fn metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationMetadata>, ChatError> {
        self.inner.metadata(conversation_id).await
    }

    async fn conversations_for(
        &self,
        participant: &str,
    ) -> Result<Vec<ConversationMetadata>, ChatError> {
        self.inner.conversations_for(participant).await
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}

pub fn text_message(id: &str, from: &str, to: &str, timestamp: i64) -> NewMessage {
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
