//! HTTP API Tests
//!
//! Drives the axum router in-process with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use rtb_common::{CreativeClass, CreativeRecord};
use rtb_dispatch::{
    create_router, AppState, Collaborators, DispatcherConfig, EventDispatcher, InMemoryCreativeCache,
    InMemoryEventStore, MessageBus, MetricsStatsSink,
};

struct NullBus;

#[async_trait::async_trait]
impl MessageBus for NullBus {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) {}
}

fn app() -> (Router, Arc<InMemoryEventStore>) {
    let store = Arc::new(InMemoryEventStore::new());
    let creatives = InMemoryCreativeCache::from_records(vec![
        CreativeRecord {
            campaign_id: 7,
            creative_id: 3,
            class: CreativeClass::Html5,
            html: Some("<div>ad</div>".to_string()),
            path: None,
            ctr_url: Some("https://advertiser.example/landing".to_string()),
            iframe_url: None,
            url: None,
            width: 300,
            height: 250,
        },
        CreativeRecord {
            campaign_id: 7,
            creative_id: 4,
            class: CreativeClass::Banner,
            html: None,
            path: Some("/creatives/4.png".to_string()),
            ctr_url: None,
            iframe_url: None,
            url: None,
            width: 728,
            height: 90,
        },
    ]);

    let dispatcher = EventDispatcher::new(
        DispatcherConfig {
            max_workers: 2,
            init_workers: 1,
            ..Default::default()
        },
        Collaborators {
            stats: Arc::new(MetricsStatsSink),
            store: store.clone(),
            bus: Arc::new(NullBus),
            creatives: Arc::new(creatives),
        },
    );

    let router = create_router(AppState {
        dispatcher: Arc::new(dispatcher),
        prometheus: None,
    });
    (router, store)
}

async fn get(router: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, String::from_utf8(body.to_vec()).unwrap())
}

const EVENT: &str = "bid_id=b1&campaign_id=7&exchange_id=ex1&timestamp_bucket=1000";

#[tokio::test]
async fn test_win_endpoint() {
    let (router, store) = app();
    let (status, _, body) = get(router, &format!("/win?{}&creative_id=3&win_price=0.42", EVENT)).await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "successful");

    let wins = store.records_for("wins");
    assert_eq!(wins.len(), 1);
    assert_eq!(wins[0].win_price, Some(0.42));
}

#[tokio::test]
async fn test_win_requires_price() {
    let (router, store) = app();
    let (status, _, body) = get(router, &format!("/win?{}&creative_id=3", EVENT)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("win_price"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_impression_html_with_click_tag() {
    let (router, _) = app();
    let (status, headers, body) = get(router, &format!("/impression?{}&creative_id=3&clicktag=abc", EVENT)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));
    assert_eq!(body, "<div>ad</div>&ct=abc");
}

#[tokio::test]
async fn test_impression_banner_path() {
    let (router, _) = app();
    let (status, _, body) = get(router, &format!("/impression?{}&creative_id=4", EVENT)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "/creatives/4.png");
}

#[tokio::test]
async fn test_click_redirects() {
    let (router, _) = app();
    let (status, headers, _) = get(router, &format!("/click?{}&creative_id=3", EVENT)).await;

    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(headers[header::LOCATION], "https://advertiser.example/landing");
}

#[tokio::test]
async fn test_missing_creative_is_no_content() {
    let (router, _) = app();
    let (status, _, body) = get(router, &format!("/click?{}&creative_id=404", EVENT)).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_test_mode_records_nothing() {
    let (router, store) = app();
    let (status, _, _) = get(router, &format!("/win?{}&creative_id=3&win_price=1&test=true", EVENT)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_unknown_option_rejected() {
    let (router, store) = app();
    let (status, _, body) = get(router, &format!("/win?{}&creative_id=3&win_price=1&debug=1", EVENT)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("debug"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_conversion_always_succeeds() {
    let (router, store) = app();
    let (status, _, _) = get(router.clone(), "/conversion?anything=goes").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = get(router, &format!("/conversion?{}&creative_id=3", EVENT)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_health_reports_pool() {
    let (router, _) = app();
    let (status, _, body) = get(router, "/health").await;

    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "UP");
    assert_eq!(json["pool"]["name"], "event_workers");
    assert_eq!(json["pool"]["max_count"], 2);
}

#[tokio::test]
async fn test_metrics_disabled_without_recorder() {
    let (router, _) = app();
    let (status, _, _) = get(router, "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
