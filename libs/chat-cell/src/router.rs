use std::sync::Arc;
use axum::{
    Router,
    routing::{get, post},
    middleware,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;
use crate::handlers::{
    ChatState,
    get_chat_identity,
    list_conversations,
    get_messages,
    send_message,
    mark_read,
    live_conversation,
};
use crate::services::chat::ChatServices;

pub fn chat_routes(state: Arc<AppConfig>, chat: Arc<ChatServices>) -> Router {
    let protected_routes = Router::new()
        .route("/identity", get(get_chat_identity))
        .route("/conversations", get(list_conversations))
        .route("/conversations/{other_id}/messages", get(get_messages).post(send_message))
        .route("/conversations/{other_id}/read", post(mark_read))
        .route("/conversations/{other_id}/live", get(live_conversation))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(ChatState { config: state, chat })
}
