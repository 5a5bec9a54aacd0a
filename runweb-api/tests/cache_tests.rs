use runweb_api::{ApiClient, ResponseCache};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_entries_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("responses.db");

    {
        let cache = ResponseCache::open(&db_path).unwrap();
        assert!(cache.put("https://example.com/games/abc", 200, r#"{"data":{}}"#).unwrap());
    }

    let cache = ResponseCache::open(&db_path).unwrap();
    let hit = cache.get("https://example.com/games/abc").unwrap().unwrap();
    assert_eq!(hit.body, r#"{"data":{}}"#);
    assert_eq!(hit.url, "https://example.com/games/abc");
}

#[test]
fn test_equivalent_urls_share_an_entry() {
    let temp_dir = TempDir::new().unwrap();
    let cache = ResponseCache::open(&temp_dir.path().join("responses.db")).unwrap();

    cache
        .put("https://example.com/runs?user=u1&game=g1", 200, "first")
        .unwrap();

    let hit = cache
        .get("https://example.com/runs?game=g1&user=u1#ignored")
        .unwrap()
        .unwrap();
    assert_eq!(hit.body, "first");
}

// ============================================================================
// Client + cache
// ============================================================================

#[tokio::test]
async fn test_second_client_reads_from_disk_cache() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("responses.db");
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/users/u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "u1"}})))
        .expect(1)
        .mount(&mock_server)
        .await;

    {
        let cache = Arc::new(ResponseCache::open(&db_path).unwrap());
        let client = ApiClient::new(&mock_server.uri()).unwrap().with_cache(cache);
        client.request("users/u1").await.unwrap();
    }

    let cache = Arc::new(ResponseCache::open(&db_path).unwrap());
    let client = ApiClient::new(&mock_server.uri()).unwrap().with_cache(cache);
    let body = client.request("users/u1").await.unwrap();
    assert_eq!(body["data"]["id"], "u1");
}
