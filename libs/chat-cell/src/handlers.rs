use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use shared_config::AppConfig;
use shared_models::{auth::User, error::AppError};

use crate::{
    services::{adapter::OutgoingMessage, chat::ChatServices},
    ChatIdentityResponse, ConversationId, ConversationSummary, LiveEvent, Message,
    SendMessageRequest, SendMessageResponse, SenderRole,
};

#[derive(Clone)]
pub struct ChatState {
    pub config: Arc<AppConfig>,
    pub chat: Arc<ChatServices>,
}

async fn resolve_conversation(
    chat: &ChatServices,
    user: &User,
    other_id: &str,
) -> Result<(String, String, ConversationId), AppError> {
    let (self_chat_id, other_chat_id) = chat.identity.resolve_pair(&user.id, other_id).await?;
    let conversation_id = ConversationId::for_pair(&self_chat_id, &other_chat_id);
    Ok((self_chat_id, other_chat_id, conversation_id))
}

/// Get the caller's chat identity
pub async fn get_chat_identity(
    State(state): State<ChatState>,
    Extension(user): Extension<User>,
) -> Result<Json<ChatIdentityResponse>, AppError> {
    let chat_identity_id = state.chat.identity.get_chat_identity_id(&user.id).await?;

    Ok(Json(ChatIdentityResponse {
        user_id: user.id,
        chat_identity_id,
    }))
}

/// List the caller's conversations, most recent first
pub async fn list_conversations(
    State(state): State<ChatState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    debug!("Conversation list request from user: {}", user.id);

    let self_chat_id = state.chat.identity.get_chat_identity_id(&user.id).await?;
    let conversations = state.chat.adapter.list_conversations_for(&self_chat_id).await?;

    let summaries: Vec<ConversationSummary> = conversations
        .into_iter()
        .map(|meta| ConversationSummary {
            other_participant: meta.other_participant(&self_chat_id).map(str::to_string),
            unread: meta.unread_for(&self_chat_id),
            conversation_id: meta.conversation_id,
            last_activity: meta.last_activity,
            last_message: meta.last_message,
        })
        .collect();

    Ok(Json(json!({
        "conversations": summaries,
        "total": summaries.len()
    })))
}

/// Get the ordered message history with another user
pub async fn get_messages(
    State(state): State<ChatState>,
    Extension(user): Extension<User>,
    Path(other_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let (_, _, conversation_id) = resolve_conversation(&state.chat, &user, &other_id).await?;
    let messages: Vec<Message> = state.chat.adapter.messages(&conversation_id).await?;

    Ok(Json(json!({
        "conversation_id": conversation_id,
        "messages": messages
    })))
}

/// Send a message to another user
pub async fn send_message(
    State(state): State<ChatState>,
    Extension(user): Extension<User>,
    Path(other_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Response, AppError> {
    info!("Send message request from user: {} to {}", user.id, other_id);

    let (self_chat_id, other_chat_id, conversation_id) =
        resolve_conversation(&state.chat, &user, &other_id).await?;

    let outgoing = OutgoingMessage {
        sender_id: self_chat_id,
        receiver_id: other_chat_id,
        content: request.content,
        message_type: request.message_type.unwrap_or_default(),
        sender_name: request
            .sender_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| user.display_name()),
        sender_role: SenderRole::from_auth_role(user.role.as_deref()),
    };

    let adapter = &state.chat.adapter;
    let conversation = &conversation_id;
    let outgoing = &outgoing;
    let message_id = state
        .chat
        .retry
        .run("send_message", move || adapter.send(conversation, outgoing.clone()))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message_id,
            conversation_id,
        }),
    )
        .into_response())
}

/// Mark everything received from another user as read
pub async fn mark_read(
    State(state): State<ChatState>,
    Extension(user): Extension<User>,
    Path(other_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let (self_chat_id, other_chat_id, conversation_id) =
        resolve_conversation(&state.chat, &user, &other_id).await?;

    state
        .chat
        .adapter
        .mark_read(&conversation_id, &self_chat_id, &other_chat_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "conversation_id": conversation_id
    })))
}

/// Upgrade to a WebSocket streaming conversation snapshots
pub async fn live_conversation(
    State(state): State<ChatState>,
    Extension(user): Extension<User>,
    Path(other_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let (_, _, conversation_id) = resolve_conversation(&state.chat, &user, &other_id).await?;
    info!("Live conversation {} opened by user: {}", conversation_id, user.id);

    let chat = state.chat.clone();
    Ok(ws.on_upgrade(move |socket| stream_conversation(socket, chat, conversation_id)))
}

async fn stream_conversation(
    socket: WebSocket,
    chat: Arc<ChatServices>,
    conversation_id: ConversationId,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<LiveEvent>();
    let error_tx = tx.clone();

    let subscription = match chat.subscriptions.subscribe_with_errors(
        conversation_id.clone(),
        move |messages| {
            let _ = tx.send(LiveEvent::Snapshot { messages });
        },
        move |e| {
            let _ = error_tx.send(LiveEvent::Error { error: e.to_string() });
        },
    ) {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("Cannot subscribe to {}: {}", conversation_id, e);
            if let Ok(payload) = serde_json::to_string(&LiveEvent::Error { error: e.to_string() }) {
                let _ = sender.send(WsMessage::Text(payload.into())).await;
            }
            return;
        }
    };

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let terminal = matches!(event, LiveEvent::Error { .. });
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize live event: {}", e);
                    continue;
                }
            };
            if sender.send(WsMessage::Text(payload.into())).await.is_err() || terminal {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let WsMessage::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    subscription.cancel();
    debug!("Live conversation {} closed", conversation_id);
}
