use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use futures::StreamExt;
use redis::{aio::PubSub, AsyncCommands};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::services::retry::RetryPolicy;
use crate::services::store::{ChatStore, CHANGE_FEED_CAPACITY};
use crate::{
    sort_messages, ChangeEvent, ChatError, ConversationId, ConversationMetadata, Message,
    MessageDocument, NewMessage, CHAT_NAMESPACE,
};
use shared_config::AppConfig;

const CHANGES_CHANNEL: &str = "chats/doctor-patient:changes";

// Flips unread messages for ARGV[1] and zeroes its counter inside Redis so a
// send racing with the acknowledgement cannot have its increment erased.
const MARK_READ_SCRIPT: &str = r#"
local entries = redis.call('HGETALL', KEYS[1])
local flipped = 0
for i = 1, #entries, 2 do
  local doc = cjson.decode(entries[i + 1])
  if doc.receiverId == ARGV[1] and not doc.read then
    doc.read = true
    redis.call('HSET', KEYS[1], entries[i], cjson.encode(doc))
    flipped = flipped + 1
  end
end
local field = 'unread:' .. ARGV[1]
local unread = tonumber(redis.call('HGET', KEYS[2], field) or '0')
if unread ~= 0 then
  redis.call('HSET', KEYS[2], field, 0)
end
if flipped > 0 or unread ~= 0 then
  redis.call('PUBLISH', ARGV[2], ARGV[3])
end
return flipped
"#;

// Raises a hash field to ARGV[2] unless it already holds a later value.
const SET_MAX_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
if tonumber(ARGV[2]) > current then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
end
return 0
"#;

fn sequence_key() -> String {
    format!("{}:seq", CHAT_NAMESPACE)
}

fn order_key(conversation_id: &ConversationId) -> String {
    format!("{}:order", conversation_id.path().messages())
}

fn index_key(participant: &str) -> String {
    format!("{}/index/{}", CHAT_NAMESPACE, participant)
}

fn unread_field(participant: &str) -> String {
    format!("unread:{}", participant)
}

/// Chat store on Redis.
///
/// Layout per conversation:
/// - `chats/doctor-patient/{id}`: metadata hash (`participants`, `last_activity`, `last_message`, `unread:{participant}`)
/// - `chats/doctor-patient/{id}/messages`: hash of message id to message document
/// - `chats/doctor-patient/{id}/messages:order`: sorted set of message ids scored by timestamp
///
/// Changes are announced on a pub/sub channel and fanned out locally.
pub struct RedisChatStore {
    pool: Pool,
    feed: broadcast::Sender<ChangeEvent>,
    change_listener: JoinHandle<()>,
}

impl RedisChatStore {
    pub async fn connect(config: &AppConfig) -> Result<Self, ChatError> {
        let redis_url = config.redis_url_or_default();

        let pool = Config::from_url(redis_url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ChatError::Write(format!("Failed to create Redis pool: {}", e)))?;

        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let client = redis::Client::open(redis_url.as_str())?;
        let pubsub = subscribe_changes(&client).await?;

        let (feed, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let change_listener = tokio::spawn(forward_changes(client, pubsub, feed.clone()));

        info!("Redis chat store initialized successfully");
        Ok(Self {
            pool,
            feed,
            change_listener,
        })
    }

    async fn get_connection(&self) -> Result<Connection, ChatError> {
        Ok(self.pool.get().await?)
    }

    fn parse_metadata(
        conversation_id: &ConversationId,
        fields: HashMap<String, String>,
    ) -> Result<Option<ConversationMetadata>, ChatError> {
        let Some(participants) = fields.get("participants") else {
            return Ok(None);
        };
        let participants: [String; 2] = serde_json::from_str(participants)?;

        let mut metadata =
            ConversationMetadata::new(conversation_id.clone(), &participants[0], &participants[1]);
        metadata.last_activity = fields
            .get("last_activity")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        metadata.last_message = fields.get("last_message").cloned();

        for (field, value) in &fields {
            if let Some(participant) = field.strip_prefix("unread:") {
                metadata
                    .unread_count
                    .insert(participant.to_string(), value.parse().unwrap_or(0));
            }
        }

        Ok(Some(metadata))
    }
}

impl Drop for RedisChatStore {
    fn drop(&mut self) {
        self.change_listener.abort();
    }
}

async fn subscribe_changes(client: &redis::Client) -> Result<PubSub, ChatError> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(CHANGES_CHANNEL).await?;
    Ok(pubsub)
}

/// Forwards pub/sub notifications into the local feed. When the pub/sub
/// connection drops, listeners get `Interrupted`; once it is back they get
/// `Resync` to cover whatever was published in between.
async fn forward_changes(
    client: redis::Client,
    mut pubsub: PubSub,
    feed: broadcast::Sender<ChangeEvent>,
) {
    let reconnect = RetryPolicy::default();

    loop {
        {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(raw) => {
                        let _ = feed.send(ChangeEvent::Conversation(ConversationId::from_stored(raw)));
                    }
                    Err(e) => warn!("Ignoring malformed chat change notification: {}", e),
                }
            }
        }

        warn!("Redis chat change feed dropped, reconnecting");
        let _ = feed.send(ChangeEvent::Interrupted(
            "redis pub/sub connection dropped".to_string(),
        ));

        let mut attempt = 1;
        pubsub = loop {
            match subscribe_changes(&client).await {
                Ok(pubsub) => break pubsub,
                Err(e) => {
                    let delay = reconnect.backoff_for(attempt);
                    warn!(
                        "Reconnecting chat change feed failed (attempt {}), retrying in {:?}: {}",
                        attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        };

        info!("Redis chat change feed restored");
        let _ = feed.send(ChangeEvent::Resync);
    }
}

#[async_trait]
impl ChatStore for RedisChatStore {
    async fn commit_send(
        &self,
        conversation_id: &ConversationId,
        message: NewMessage,
    ) -> Result<Message, ChatError> {
        let mut conn = self.get_connection().await?;

        let sequence: u64 = conn.incr(sequence_key(), 1).await?;
        let message = message.into_message(conversation_id.clone(), sequence);
        let document = serde_json::to_string(&MessageDocument::from(&message))?;

        let mut participants = [message.sender_id.clone(), message.receiver_id.clone()];
        participants.sort();
        let participants = serde_json::to_string(&participants)?;

        let path = conversation_id.path();
        let metadata_key = path.metadata();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(path.messages(), &message.id, document).ignore()
            .zadd(order_key(conversation_id), &message.id, message.timestamp).ignore()
            .hset(&metadata_key, "participants", participants).ignore()
            .cmd("EVAL")
                .arg(SET_MAX_SCRIPT)
                .arg(1)
                .arg(&metadata_key)
                .arg("last_activity")
                .arg(message.timestamp)
                .ignore()
            .hset(&metadata_key, "last_message", &message.content).ignore()
            .hincr(&metadata_key, unread_field(&message.receiver_id), 1).ignore()
            .hset_nx(&metadata_key, unread_field(&message.sender_id), 0).ignore()
            .sadd(index_key(&message.sender_id), conversation_id.as_str()).ignore()
            .sadd(index_key(&message.receiver_id), conversation_id.as_str()).ignore()
            .publish(CHANGES_CHANNEL, conversation_id.as_str()).ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        debug!("Stored message {} at {}", message.id, path.message(&message.id));
        Ok(message)
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &str,
    ) -> Result<usize, ChatError> {
        let mut conn = self.get_connection().await?;
        let path = conversation_id.path();

        let flipped: usize = redis::Script::new(MARK_READ_SCRIPT)
            .key(path.messages())
            .key(path.metadata())
            .arg(reader_id)
            .arg(CHANGES_CHANNEL)
            .arg(conversation_id.as_str())
            .invoke_async(&mut conn)
            .await?;

        Ok(flipped)
    }

    async fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, ChatError> {
        let mut conn = self.get_connection().await?;

        let ids: Vec<String> = conn.zrange(order_key(conversation_id), 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let documents: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(conversation_id.path().messages())
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut messages = documents
            .into_iter()
            .flatten()
            .map(|raw| {
                serde_json::from_str::<MessageDocument>(&raw)?.into_message(conversation_id.clone())
            })
            .collect::<Result<Vec<_>, ChatError>>()?;

        sort_messages(&mut messages);
        Ok(messages)
    }

    async fn metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationMetadata>, ChatError> {
        let mut conn = self.get_connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(conversation_id.path().metadata()).await?;
        Self::parse_metadata(conversation_id, fields)
    }

    async fn conversations_for(
        &self,
        participant: &str,
    ) -> Result<Vec<ConversationMetadata>, ChatError> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.smembers(index_key(participant)).await?;
        drop(conn);

        let mut conversations = Vec::with_capacity(ids.len());
        for raw in ids {
            let conversation_id = ConversationId::from_stored(raw);
            if let Some(metadata) = self.metadata(&conversation_id).await? {
                conversations.push(metadata);
            }
        }
        Ok(conversations)
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}
