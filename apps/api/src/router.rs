use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use chat_cell::chat_routes;
use chat_cell::services::chat::ChatServices;
use shared_config::AppConfig;

pub fn create_router(state: Arc<AppConfig>, chat: Arc<ChatServices>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic chat API is running!" }))
        .nest("/chat", chat_routes(state, chat))
}
