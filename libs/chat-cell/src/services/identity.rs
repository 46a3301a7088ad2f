use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Method,
};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::{ChatError, IdentityMapping};

const MAPPING_TABLE: &str = "/rest/v1/chat_identity_mappings";

/// Resolved ids kept in process before older entries are evicted.
pub const IDENTITY_CACHE_CAPACITY: usize = 10_000;

/// Persistent home of identity mappings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Create-if-absent: stores `candidate_chat_id` for `source_id` unless a
    /// mapping already exists, and returns whichever mapping won.
    async fn get_or_create(
        &self,
        source_id: &str,
        candidate_chat_id: &str,
    ) -> Result<IdentityMapping, ChatError>;

    async fn find(&self, source_id: &str) -> Result<Option<IdentityMapping>, ChatError>;
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    mappings: Mutex<HashMap<String, IdentityMapping>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get_or_create(
        &self,
        source_id: &str,
        candidate_chat_id: &str,
    ) -> Result<IdentityMapping, ChatError> {
        let mut mappings = self.mappings.lock().unwrap_or_else(PoisonError::into_inner);
        let mapping = mappings
            .entry(source_id.to_string())
            .or_insert_with(|| IdentityMapping {
                source_identity_id: source_id.to_string(),
                chat_identity_id: candidate_chat_id.to_string(),
                created_at: Some(Utc::now()),
            });
        Ok(mapping.clone())
    }

    async fn find(&self, source_id: &str) -> Result<Option<IdentityMapping>, ChatError> {
        Ok(self
            .mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .cloned())
    }
}

/// Mappings in the `chat_identity_mappings` table, unique on `source_identity_id`.
pub struct SupabaseIdentityStore {
    supabase: SupabaseClient,
}

impl SupabaseIdentityStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
        }
    }

    fn parse_row(row: Value) -> Result<IdentityMapping, ChatError> {
        serde_json::from_value(row).map_err(|e| {
            ChatError::IdentityResolution(format!("malformed identity mapping row: {}", e))
        })
    }
}

#[async_trait]
impl IdentityStore for SupabaseIdentityStore {
    async fn get_or_create(
        &self,
        source_id: &str,
        candidate_chat_id: &str,
    ) -> Result<IdentityMapping, ChatError> {
        let mut headers = HeaderMap::new();
        // The unique constraint settles concurrent creators; losers get an empty result
        headers.insert(
            "Prefer",
            HeaderValue::from_static("resolution=ignore-duplicates,return=representation"),
        );

        let path = format!("{}?on_conflict=source_identity_id", MAPPING_TABLE);
        let inserted: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::POST,
                &path,
                None,
                Some(json!({
                    "source_identity_id": source_id,
                    "chat_identity_id": candidate_chat_id,
                })),
                Some(headers),
            )
            .await
            .map_err(|e| {
                error!("Failed to upsert identity mapping for {}: {}", source_id, e);
                ChatError::IdentityResolution(e.to_string())
            })?;

        if let Some(row) = inserted.into_iter().next() {
            info!("Created chat identity mapping for {}", source_id);
            return Self::parse_row(row);
        }

        self.find(source_id).await?.ok_or_else(|| {
            ChatError::IdentityResolution(format!(
                "mapping for {} neither created nor found",
                source_id
            ))
        })
    }

    async fn find(&self, source_id: &str) -> Result<Option<IdentityMapping>, ChatError> {
        let path = format!(
            "{}?source_identity_id=eq.{}",
            MAPPING_TABLE,
            urlencoding::encode(source_id)
        );

        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, &path, None, None)
            .await
            .map_err(|e| ChatError::IdentityResolution(e.to_string()))?;

        rows.into_iter().next().map(Self::parse_row).transpose()
    }
}

/// Resolves primary-system user ids to chat-store identities.
pub struct IdentityMappingService {
    store: Arc<dyn IdentityStore>,
    cache: RwLock<IdentityCache>,
}

/// Mappings never change once created, so any entry may be evicted; the
/// store answers again on the next miss.
struct IdentityCache {
    entries: HashMap<String, String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl IdentityCache {
    fn get(&self, source_id: &str) -> Option<&String> {
        self.entries.get(source_id)
    }

    fn insert(&mut self, source_id: String, chat_id: String) {
        if self.entries.contains_key(&source_id) {
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.order.push_back(source_id.clone());
        self.entries.insert(source_id, chat_id);
    }
}

impl IdentityMappingService {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self::with_cache_capacity(store, IDENTITY_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(store: Arc<dyn IdentityStore>, capacity: usize) -> Self {
        Self {
            store,
            cache: RwLock::new(IdentityCache {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub async fn cached_identities(&self) -> usize {
        self.cache.read().await.entries.len()
    }

    /// Chat id proposed for a user who has none yet.
    pub fn derive_chat_id(source_id: &str) -> String {
        format!("chat-{}", source_id)
    }

    pub async fn get_chat_identity_id(&self, source_id: &str) -> Result<String, ChatError> {
        if source_id.trim().is_empty() {
            return Err(ChatError::Validation("user id must not be empty".to_string()));
        }

        if let Some(chat_id) = self.cache.read().await.get(source_id) {
            return Ok(chat_id.clone());
        }

        let mapping = self
            .store
            .get_or_create(source_id, &Self::derive_chat_id(source_id))
            .await
            .map_err(|e| match e {
                ChatError::IdentityResolution(_) | ChatError::Validation(_) => e,
                other => ChatError::IdentityResolution(other.to_string()),
            })?;

        debug!("Resolved {} -> {}", source_id, mapping.chat_identity_id);
        self.cache
            .write()
            .await
            .insert(source_id.to_string(), mapping.chat_identity_id.clone());

        Ok(mapping.chat_identity_id)
    }

    /// Resolves both sides of a conversation; neither id is returned unless both resolve.
    pub async fn resolve_pair(
        &self,
        self_id: &str,
        other_id: &str,
    ) -> Result<(String, String), ChatError> {
        if self_id == other_id {
            return Err(ChatError::Validation(
                "cannot open a conversation with yourself".to_string(),
            ));
        }

        tokio::try_join!(
            self.get_chat_identity_id(self_id),
            self.get_chat_identity_id(other_id),
        )
    }
}
