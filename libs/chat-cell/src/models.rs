use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ChatError;

/// Root under which every doctor-patient conversation is stored.
pub const CHAT_NAMESPACE: &str = "chats/doctor-patient";

/// Canonical id of the conversation between two chat identities.
///
/// Built from the *chat* identity ids (never the primary auth ids) so that
/// both participants, whichever side opens the chat, land on the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn for_pair(a: &str, b: &str) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}_{}", first, second))
    }

    /// Rehydrates an id previously produced by [`ConversationId::for_pair`].
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn path(&self) -> ConversationPath<'_> {
        ConversationPath(self)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location scheme of a conversation inside the realtime store.
#[derive(Debug, Clone, Copy)]
pub struct ConversationPath<'a>(&'a ConversationId);

impl ConversationPath<'_> {
    pub fn metadata(&self) -> String {
        format!("{}/{}", CHAT_NAMESPACE, self.0)
    }

    pub fn messages(&self) -> String {
        format!("{}/{}/messages", CHAT_NAMESPACE, self.0)
    }

    pub fn message(&self, message_id: &str) -> String {
        format!("{}/{}/messages/{}", CHAT_NAMESPACE, self.0, message_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Patient,
    Doctor,
}

impl SenderRole {
    /// Maps the auth platform's role claim; anyone who is not a doctor chats as a patient.
    pub fn from_auth_role(role: Option<&str>) -> Self {
        match role {
            Some("doctor") => SenderRole::Doctor,
            _ => SenderRole::Patient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    /// Milliseconds since the epoch, strictly increasing per sender.
    pub timestamp: i64,
    pub read: bool,
    pub message_type: MessageType,
    pub sender_name: String,
    pub sender_role: SenderRole,
    /// Store-assigned insertion order; breaks timestamp ties.
    pub sequence: u64,
}

impl Message {
    pub fn is_unread_for(&self, reader_id: &str) -> bool {
        !self.read && self.receiver_id == reader_id
    }
}

/// Sorts messages the way every snapshot is delivered: timestamp, then insertion order.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by_key(|m| (m.timestamp, m.sequence));
}

/// A message before the store has accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub timestamp: i64,
    pub message_type: MessageType,
    pub sender_name: String,
    pub sender_role: SenderRole,
}

impl NewMessage {
    pub fn into_message(self, conversation_id: ConversationId, sequence: u64) -> Message {
        Message {
            id: self.id,
            conversation_id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            timestamp: self.timestamp,
            read: false,
            message_type: self.message_type,
            sender_name: self.sender_name,
            sender_role: self.sender_role,
            sequence,
        }
    }
}

/// Shape of a message as stored in the realtime document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDocument {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub read: bool,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub sender_name: String,
    pub sender_role: SenderRole,
    #[serde(default)]
    pub seq: u64,
}

impl From<&Message> for MessageDocument {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            read: message.read,
            message_type: message.message_type,
            sender_name: message.sender_name.clone(),
            sender_role: message.sender_role,
            seq: message.sequence,
        }
    }
}

impl MessageDocument {
    pub fn into_message(self, conversation_id: ConversationId) -> Result<Message, ChatError> {
        if self.content.trim().is_empty() {
            return Err(ChatError::Validation(format!(
                "stored message {} has empty content",
                self.id
            )));
        }

        Ok(Message {
            id: self.id,
            conversation_id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            timestamp: self.timestamp,
            read: self.read,
            message_type: self.message_type,
            sender_name: self.sender_name,
            sender_role: self.sender_role,
            sequence: self.seq,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub conversation_id: ConversationId,
    /// Both chat identities, sorted.
    pub participants: [String; 2],
    pub last_activity: i64,
    pub last_message: Option<String>,
    pub unread_count: HashMap<String, u32>,
}

impl ConversationMetadata {
    pub fn new(conversation_id: ConversationId, a: &str, b: &str) -> Self {
        let mut participants = [a.to_string(), b.to_string()];
        participants.sort();

        let unread_count = participants
            .iter()
            .map(|p| (p.clone(), 0))
            .collect();

        Self {
            conversation_id,
            participants,
            last_activity: 0,
            last_message: None,
            unread_count,
        }
    }

    pub fn unread_for(&self, participant: &str) -> u32 {
        self.unread_count.get(participant).copied().unwrap_or(0)
    }

    pub fn has_participant(&self, participant: &str) -> bool {
        self.participants.iter().any(|p| p == participant)
    }

    pub fn other_participant(&self, participant: &str) -> Option<&str> {
        if !self.has_participant(participant) {
            return None;
        }
        self.participants
            .iter()
            .find(|p| p.as_str() != participant)
            .map(String::as_str)
    }
}

/// Row of the `chat_identity_mappings` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub source_identity_id: String,
    pub chat_identity_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// What the store's change feed announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Messages or metadata of one conversation changed.
    Conversation(ConversationId),
    /// The notification stream dropped; changes may be missed until `Resync`.
    Interrupted(String),
    /// The stream is back after a gap; every listener must re-read.
    Resync,
}

// HTTP DTOs

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatIdentityResponse {
    pub user_id: String,
    pub chat_identity_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub other_participant: Option<String>,
    pub last_activity: i64,
    pub last_message: Option<String>,
    pub unread: u32,
}

/// Frame pushed over a live conversation WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Snapshot { messages: Vec<Message> },
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, timestamp: i64, sequence: u64) -> Message {
        NewMessage {
            id: id.to_string(),
            sender_id: "chat-p1".to_string(),
            receiver_id: "chat-d1".to_string(),
            content: "hi".to_string(),
            timestamp,
            message_type: MessageType::Text,
            sender_name: "Pat".to_string(),
            sender_role: SenderRole::Patient,
        }
        .into_message(ConversationId::for_pair("chat-p1", "chat-d1"), sequence)
    }

    #[test]
    fn test_conversation_id_is_order_independent() {
        let pairs = [("chat-p1", "chat-d1"), ("a", "b"), ("same", "same"), ("", "x")];
        for (a, b) in pairs {
            assert_eq!(ConversationId::for_pair(a, b), ConversationId::for_pair(b, a));
        }
        assert_eq!(ConversationId::for_pair("chat-p1", "chat-d1").as_str(), "chat-d1_chat-p1");
    }

    #[test]
    fn test_conversation_paths() {
        let id = ConversationId::for_pair("chat-p1", "chat-d1");
        assert_eq!(id.path().metadata(), "chats/doctor-patient/chat-d1_chat-p1");
        assert_eq!(
            id.path().message("m1"),
            "chats/doctor-patient/chat-d1_chat-p1/messages/m1"
        );
        assert_eq!(id.path().messages(), "chats/doctor-patient/chat-d1_chat-p1/messages");
    }

    #[test]
    fn test_sort_breaks_ties_by_sequence() {
        let mut messages = vec![message("c", 20, 3), message("b", 10, 2), message("a", 10, 1)];
        sort_messages(&mut messages);
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_document_shape_uses_store_keys() {
        let original = message("m1", 42, 7);
        let doc = serde_json::to_value(MessageDocument::from(&original)).unwrap();
        assert_eq!(doc["senderId"], "chat-p1");
        assert_eq!(doc["type"], "text");
        assert_eq!(doc["senderRole"], "patient");

        let parsed: MessageDocument = serde_json::from_value(doc).unwrap();
        let back = parsed.into_message(original.conversation_id.clone()).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_metadata_participants_sorted() {
        let id = ConversationId::for_pair("z", "a");
        let meta = ConversationMetadata::new(id, "z", "a");
        assert_eq!(meta.participants, ["a".to_string(), "z".to_string()]);
        assert_eq!(meta.unread_for("a"), 0);
        assert_eq!(meta.other_participant("a"), Some("z"));
        assert_eq!(meta.other_participant("q"), None);
    }

    #[test]
    fn test_sender_role_from_auth_role() {
        assert_eq!(SenderRole::from_auth_role(Some("doctor")), SenderRole::Doctor);
        assert_eq!(SenderRole::from_auth_role(Some("patient")), SenderRole::Patient);
        assert_eq!(SenderRole::from_auth_role(None), SenderRole::Patient);
    }
}
