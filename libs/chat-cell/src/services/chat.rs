use std::sync::Arc;

use tracing::info;

use shared_config::{AppConfig, ChatBackend};

use crate::services::{
    adapter::MessageStoreAdapter,
    controller::ConversationController,
    identity::{IdentityMappingService, IdentityStore, MemoryIdentityStore, SupabaseIdentityStore},
    redis_store::RedisChatStore,
    retry::RetryPolicy,
    store::{ChatStore, MemoryChatStore},
    subscription::{ConnectionManager, SubscriptionManager},
};
use crate::ChatError;

/// Everything a conversation needs, wired once per process and shared by `Arc`.
pub struct ChatServices {
    pub identity: IdentityMappingService,
    pub adapter: MessageStoreAdapter,
    pub connection: Arc<ConnectionManager>,
    pub subscriptions: SubscriptionManager,
    pub retry: RetryPolicy,
}

impl ChatServices {
    /// Wires the services and connects.
    pub fn new(
        store: Arc<dyn ChatStore>,
        identity_store: Arc<dyn IdentityStore>,
        retry: RetryPolicy,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(store.clone()));
        connection.connect();

        Self {
            identity: IdentityMappingService::new(identity_store),
            adapter: MessageStoreAdapter::new(store),
            subscriptions: SubscriptionManager::new(connection.clone()),
            connection,
            retry,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryChatStore::new()),
            Arc::new(MemoryIdentityStore::new()),
            RetryPolicy::none(),
        )
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self, ChatError> {
        let store: Arc<dyn ChatStore> = match config.chat_backend {
            ChatBackend::Memory => {
                info!("Using in-memory chat store");
                Arc::new(MemoryChatStore::new())
            }
            ChatBackend::Redis => Arc::new(RedisChatStore::connect(config).await?),
        };

        let identity_store: Arc<dyn IdentityStore> = if config.is_identity_store_remote() {
            info!("Using Supabase identity mappings");
            Arc::new(SupabaseIdentityStore::new(config))
        } else {
            info!("Supabase not configured, keeping identity mappings in memory");
            Arc::new(MemoryIdentityStore::new())
        };

        Ok(Self::new(store, identity_store, RetryPolicy::from_config(config)))
    }

    /// A fresh controller for one conversation view.
    pub fn controller(self: &Arc<Self>) -> ConversationController {
        ConversationController::new(self.clone())
    }

    pub fn shutdown(&self) {
        self.connection.disconnect();
    }
}
