//! HTTP store behavior against a fake tagging endpoint.

use std::collections::BTreeSet;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tagsync_core::config::StoreConfig;
use tagsync_core::{ResourceStore, StoreError, TagMap};
use tagsync_http::{HttpResourceStore, HttpStoreError, REGION_HEADER, RUN_ID_HEADER};
use uuid::Uuid;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(endpoint: &str) -> StoreConfig {
    StoreConfig {
        endpoint: endpoint.to_string(),
        region: Some("us-east-1".into()),
        ..StoreConfig::default()
    }
}

fn store(server: &MockServer) -> HttpResourceStore {
    HttpResourceStore::new(&config(&server.uri())).expect("store")
}

fn tag_map(pairs: &[(&str, &str)]) -> TagMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[tokio::test]
async fn lists_customer_managed_policies_with_pagination_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/policies"))
        .and(query_param("scope", "local"))
        .and(query_param("page_token", "abc"))
        .and(header(REGION_HEADER, "us-east-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "policies": [
                {"id": "p-1", "name": "ec2-readonly", "tags": {"team": "ops"}},
                {"id": "p-2", "name": "s3-admin", "scope": "customer_managed"}
            ],
            "next_token": "def"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = store(&server).list_policies(Some("abc")).await.unwrap();

    assert_eq!(page.policies.len(), 2);
    assert_eq!(page.policies[0].tags, tag_map(&[("team", "ops")]));
    assert!(page.policies[1].tags.is_empty());
    assert_eq!(page.next_token.as_deref(), Some("def"));
}

#[tokio::test]
async fn last_page_has_no_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/policies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"policies": []})))
        .mount(&server)
        .await;

    let page = store(&server).list_policies(None).await.unwrap();

    assert!(page.policies.is_empty());
    assert_eq!(page.next_token, None);
}

#[tokio::test]
async fn lists_attached_roles_with_run_id_header() {
    let server = MockServer::start().await;
    let run_id = Uuid::new_v4();
    Mock::given(method("GET"))
        .and(path("/policies/p-1/roles"))
        .and(header(RUN_ID_HEADER, run_id.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "roles": [{"id": "r-1", "name": "ops", "tags": {"env": "prod"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let roles = store(&server)
        .with_run_id(run_id)
        .list_attached_roles("p-1")
        .await
        .unwrap();

    assert_eq!(roles.len(), 1);
    assert_eq!(roles[0].tags, tag_map(&[("env", "prod")]));
}

#[tokio::test]
async fn policy_ids_are_encoded_as_one_segment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/policies/arn:aws:iam::123456789012:policy%2Fops/roles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"roles": []})))
        .expect(1)
        .mount(&server)
        .await;

    let store = HttpResourceStore::new(&config(&format!("{}/api/", server.uri()))).unwrap();
    let roles = store
        .list_attached_roles("arn:aws:iam::123456789012:policy/ops")
        .await
        .unwrap();

    assert!(roles.is_empty());
}

#[tokio::test]
async fn tag_and_untag_use_put_and_delete() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/policies/p-1/tags"))
        .and(body_json(json!({"tags": {"team": "ops"}})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/policies/p-1/tags"))
        .and(query_param("key", "legacy"))
        .and(query_param("key", "old"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&server);
    store
        .tag_policy("p-1", &tag_map(&[("team", "ops")]))
        .await
        .unwrap();
    store
        .untag_policy(
            "p-1",
            &BTreeSet::from(["legacy".to_string(), "old".to_string()]),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn batched_update_posts_both_halves() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/policies/p-1/tags"))
        .and(body_json(json!({"set": {"team": "ops"}, "remove": ["old"]})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = HttpResourceStore::new(&StoreConfig {
        batched_updates: true,
        ..config(&server.uri())
    })
    .unwrap();

    assert!(store.supports_batched_update());
    store
        .update_policy_tags(
            "p-1",
            &tag_map(&[("team", "ops")]),
            &BTreeSet::from(["old".to_string()]),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn batched_update_is_unsupported_unless_enabled() {
    let server = MockServer::start().await;
    let store = store(&server);

    assert!(!store.supports_batched_update());
    assert_eq!(
        store
            .update_policy_tags("p-1", &TagMap::new(), &BTreeSet::new())
            .await
            .unwrap_err(),
        StoreError::Unsupported("update_policy_tags")
    );
}

#[tokio::test]
async fn error_statuses_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/policies/throttled/roles"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/policies/denied/roles"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({"message": "not authorized"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/policies/gone/roles"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/policies/broken/roles"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let store = store(&server);

    assert_eq!(
        store.list_attached_roles("throttled").await.unwrap_err(),
        StoreError::Throttled {
            retry_after: Some(Duration::from_secs(2))
        }
    );
    assert_eq!(
        store.list_attached_roles("denied").await.unwrap_err(),
        StoreError::PermissionDenied("HTTP 403 Forbidden: not authorized".into())
    );
    assert!(matches!(
        store.list_attached_roles("gone").await.unwrap_err(),
        StoreError::NotFound(_)
    ));
    assert_eq!(
        store.list_attached_roles("broken").await.unwrap_err(),
        StoreError::Transient("HTTP 503 Service Unavailable: upstream unavailable".into())
    );
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/policies"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = store(&server).list_policies(None).await.unwrap_err();

    assert!(matches!(err, StoreError::Rejected(_)), "{err:?}");
}

#[tokio::test]
async fn slow_responses_time_out_as_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/policies"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"policies": []}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let store = HttpResourceStore::new(&StoreConfig {
        request_timeout_ms: 100,
        ..config(&server.uri())
    })
    .unwrap();

    assert!(matches!(
        store.list_policies(None).await.unwrap_err(),
        StoreError::Transient(_)
    ));
}

#[test]
fn construction_requires_region_and_valid_endpoint() {
    let missing_region = StoreConfig {
        region: None,
        ..config("https://tags.example.internal")
    };
    assert!(matches!(
        HttpResourceStore::new(&missing_region),
        Err(HttpStoreError::Config(_))
    ));

    assert!(matches!(
        HttpResourceStore::new(&config("not a url")),
        Err(HttpStoreError::Config(_))
    ));
}
