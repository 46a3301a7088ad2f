use std::sync::Arc;

use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chat_cell::services::identity::{IdentityMappingService, IdentityStore, SupabaseIdentityStore};
use chat_cell::ChatError;
use shared_utils::test_utils::{MockSupabaseResponses, TestConfig};

const MAPPINGS: &str = "/rest/v1/chat_identity_mappings";

#[tokio::test]
async fn test_get_or_create_inserts_new_mapping() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    Mock::given(method("POST"))
        .and(path(MAPPINGS))
        .and(query_param("on_conflict", "source_identity_id"))
        .and(header("Prefer", "resolution=ignore-duplicates,return=representation"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            MockSupabaseResponses::identity_mapping_response("p1", "chat-p1")
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = SupabaseIdentityStore::new(&config);
    let mapping = store.get_or_create("p1", "chat-p1").await.unwrap();

    assert_eq!(mapping.source_identity_id, "p1");
    assert_eq!(mapping.chat_identity_id, "chat-p1");
    assert!(mapping.created_at.is_some());
}

#[tokio::test]
async fn test_get_or_create_returns_existing_mapping_on_conflict() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    // Insert ignored: someone else created the mapping first
    Mock::given(method("POST"))
        .and(path(MAPPINGS))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(MAPPINGS))
        .and(query_param("source_identity_id", "eq.p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::identity_mapping_response("p1", "legacy-chat-7")
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let service = IdentityMappingService::new(Arc::new(SupabaseIdentityStore::new(&config)));

    assert_eq!(service.get_chat_identity_id("p1").await.unwrap(), "legacy-chat-7");
    // Cached: the GET expectation above allows a single call
    assert_eq!(service.get_chat_identity_id("p1").await.unwrap(), "legacy-chat-7");
}

#[tokio::test]
async fn test_find_missing_mapping_is_none() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    Mock::given(method("GET"))
        .and(path(MAPPINGS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let store = SupabaseIdentityStore::new(&config);
    assert!(store.find("nobody").await.unwrap().is_none());
}

#[tokio::test]
async fn test_find_encodes_reserved_characters_in_id() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    // Unencoded, `&x` would split into a second query parameter
    Mock::given(method("GET"))
        .and(path(MAPPINGS))
        .and(query_param("source_identity_id", "eq.user 1&x"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::identity_mapping_response("user 1&x", "chat-user-1")
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = SupabaseIdentityStore::new(&config);
    let mapping = store.find("user 1&x").await.unwrap().unwrap();

    assert_eq!(mapping.source_identity_id, "user 1&x");
    assert_eq!(mapping.chat_identity_id, "chat-user-1");
}

#[tokio::test]
async fn test_store_outage_is_identity_resolution_error() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    Mock::given(method("POST"))
        .and(path(MAPPINGS))
        .respond_with(ResponseTemplate::new(500).set_body_json(
            MockSupabaseResponses::error_response("database unavailable", "XX000"),
        ))
        .mount(&mock_server)
        .await;

    let service = IdentityMappingService::new(Arc::new(SupabaseIdentityStore::new(&config)));

    assert_matches!(
        service.resolve_pair("p1", "d1").await,
        Err(ChatError::IdentityResolution(_))
    );
}

#[tokio::test]
async fn test_malformed_row_is_identity_resolution_error() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    Mock::given(method("POST"))
        .and(path(MAPPINGS))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([{ "unexpected": true }])))
        .mount(&mock_server)
        .await;

    let store = SupabaseIdentityStore::new(&config);
    assert_matches!(
        store.get_or_create("p1", "chat-p1").await,
        Err(ChatError::IdentityResolution(_))
    );
}
