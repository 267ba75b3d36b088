//! Integration tests for the CSRF token lifecycle (spec §4.3 "CSRF
//! lifecycle", Invariant 7) against a mocked OData service.

use std::time::Duration;

use odata_mcp_bridge::metadata::{Capabilities, EntitySet, EntityType, Property, ServiceMetadata};
use odata_mcp_bridge::request::RequestEngine;
use odata_mcp_bridge::session::{Auth, Session};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sample_metadata(base_url: &str) -> ServiceMetadata {
    let mut entity_types = std::collections::HashMap::new();
    entity_types.insert(
        "Product".to_string(),
        EntityType {
            name: "Product".to_string(),
            qualified_name: "NS.Product".to_string(),
            properties: vec![Property {
                name: "ProductID".to_string(),
                edm_type: "Edm.Int32".to_string(),
                nullable: false,
                is_key: true,
                max_length: None,
            }],
        },
    );
    let mut entity_sets = std::collections::HashMap::new();
    entity_sets.insert(
        "Products".to_string(),
        EntitySet {
            name: "Products".to_string(),
            entity_type_name: "Product".to_string(),
            capabilities: Capabilities::default(),
        },
    );
    ServiceMetadata {
        base_url: base_url.to_string(),
        entity_types,
        entity_sets,
        function_imports: vec![],
        service_id: "test".to_string(),
    }
}

#[tokio::test]
async fn csrf_token_fetched_lazily_then_reused() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/"))
        .and(header("X-CSRF-Token", "Fetch"))
        .respond_with(ResponseTemplate::new(200).insert_header("X-CSRF-Token", "tok-1"))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/Products"))
        .and(header("X-CSRF-Token", "tok-1"))
        .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"d":{"ProductID":1}}"#))
        .expect(2)
        .mount(&server)
        .await;

    let base_url = format!("{}/", server.uri());
    let session = Session::new(base_url.clone(), Auth::None, Duration::from_secs(5)).unwrap();
    let metadata = sample_metadata(&base_url);
    let engine = RequestEngine {
        session: &session,
        metadata: &metadata,
        legacy_dates: true,
        verbose_errors: false,
    };

    let set = &metadata.entity_sets["Products"];
    let entity_type = &metadata.entity_types["Product"];

    let mut payload = serde_json::Map::new();
    payload.insert("ProductID".to_string(), serde_json::json!(1));
    engine.create(set, entity_type, payload.clone()).await.unwrap();

    // Second create reuses the already-fetched token; HEAD is expect(1).
    engine.create(set, entity_type, payload).await.unwrap();
}

#[tokio::test]
async fn csrf_403_triggers_exactly_one_retry_then_surfaces() {
    let server = MockServer::start().await;

    // A server that always rejects the token: the bridge must fetch twice
    // (initial + one refresh) and POST twice (initial + one retry), never
    // looping further (spec Invariant 7).
    Mock::given(method("HEAD"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).insert_header("X-CSRF-Token", "always-stale"))
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/Products"))
        .respond_with(ResponseTemplate::new(403).set_body_string(r#"{"error":{"message":{"value":"CSRF token validation failed"}}}"#))
        .expect(2)
        .mount(&server)
        .await;

    let base_url = format!("{}/", server.uri());
    let session = Session::new(base_url.clone(), Auth::None, Duration::from_secs(5)).unwrap();
    let metadata = sample_metadata(&base_url);
    let engine = RequestEngine {
        session: &session,
        metadata: &metadata,
        legacy_dates: true,
        verbose_errors: false,
    };

    let set = &metadata.entity_sets["Products"];
    let entity_type = &metadata.entity_types["Product"];
    let mut payload = serde_json::Map::new();
    payload.insert("ProductID".to_string(), serde_json::json!(1));

    let result = engine.create(set, entity_type, payload).await;
    assert!(result.is_err());
    // `server` drops at end of scope, at which point wiremock verifies the
    // `expect(2)` counts registered above.
}
