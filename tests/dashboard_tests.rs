
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use relay_lite::dashboard::{router, DashboardState};
use relay_lite::notifier::Subscriber;

use test_harness::{test_node_config, wait_for, FakeDatabase, TestCluster, TestNode};

fn app(node: &TestNode) -> Router {
    router(DashboardState {
        config: node.node.config.clone(),
        hub: node.node.hub.clone(),
        peer: node.node.peer.clone(),
    })
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_status_reports_leader_and_channels() {
    let db = FakeDatabase::new();
    let node = TestCluster::start_node(&db, test_node_config("oban", "web-1")).await;
    assert!(
        wait_for(|| node.is_leader(), Duration::from_secs(2), Duration::from_millis(10)).await
    );

    let (sub, _rx) = Subscriber::new();
    node.node
        .hub
        .subscribe(&sub, ["signal", "insert"])
        .await
        .unwrap();

    let (status, json) = get_json(app(&node), "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["name"], "oban");
    assert_eq!(json["node"], "web-1");
    assert_eq!(json["ident"], "oban.web-1");
    assert_eq!(json["is_leader"], true);
    assert_eq!(json["connected"], true);
    assert_eq!(json["channels"], serde_json::json!(["insert", "signal"]));
}

#[tokio::test]
async fn test_status_after_connection_loss() {
    let db = FakeDatabase::new();
    let node = TestCluster::start_node(&db, test_node_config("oban", "web-2")).await;
    assert!(
        wait_for(|| node.is_leader(), Duration::from_secs(2), Duration::from_millis(10)).await
    );

    node.conn.disconnect().await;
    assert!(
        wait_for(|| !node.is_leader(), Duration::from_secs(1), Duration::from_millis(5)).await
    );

    let (status, json) = get_json(app(&node), "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["connected"], false);
    assert_eq!(json["is_leader"], false);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let db = FakeDatabase::new();
    let node = TestCluster::start_node(&db, test_node_config("oban", "web-3")).await;

    let (status, _) = get_json(app(&node), "/api/jobs").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_allows_cross_origin_requests() {
    let db = FakeDatabase::new();
    let node = TestCluster::start_node(&db, test_node_config("oban", "web-4")).await;

    let response = app(&node)
        .oneshot(
            Request::builder()
                .uri("/api/status")
                .header("origin", "http://localhost:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
}
