//! # Chat Cell
//!
//! Realtime doctor-patient messaging.
//!
//! ```text
//! +------------------------------------------------------------+
//! |                        Chat Cell                           |
//! +------------------------------------------------------------+
//! |  handlers.rs         |  HTTP + WebSocket endpoints         |
//! |  router.rs           |  Route definitions                  |
//! |  models.rs           |  Messages, metadata, ids, DTOs      |
//! |  services/           |                                     |
//! |    identity.rs       |  Auth id -> chat id mapping         |
//! |    store.rs          |  Store trait + in-memory store      |
//! |    redis_store.rs    |  Redis-backed store                 |
//! |    adapter.rs        |  send / mark read / list            |
//! |    subscription.rs   |  Connection + live listeners        |
//! |    controller.rs     |  Per-view conversation state        |
//! |    retry.rs          |  Backoff policy for writes          |
//! +------------------------------------------------------------+
//! ```
//!
//! Conversations live at `chats/doctor-patient/{conversationId}` with their
//! messages under `.../messages/{messageId}`. The conversation id is the two
//! participants' chat identity ids, sorted and joined with `_`.

pub mod models;
pub mod services;
pub mod error;
pub mod handlers;
pub mod router;

pub use models::*;
pub use error::*;
pub use services::*;
pub use router::chat_routes;
