//! Client management and admin routes.

use std::time::Duration;

use axum::http::StatusCode;
use balancer::admin::handlers::{BackendStatus, ClientLimit};
use serde_json::json;

mod common;
use common::TestBalancer;

async fn start(api_key: Option<&str>) -> TestBalancer {
    let backend = common::start_mock_backend("ok").await;
    let mut config = common::config(&[backend]);
    config.admin.api_key = api_key.map(str::to_string);
    TestBalancer::start(config).await
}

#[tokio::test]
async fn test_client_endpoints() {
    let lb = start(None).await;
    let client = common::client();

    let res = client
        .post(lb.url("/clients"))
        .json(&json!({ "client_id": "test_client", "rate": 20, "period": "1m" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let limit = lb.limiter.get_limit("test_client").unwrap();
    assert_eq!(limit.rate(), 20);
    assert_eq!(limit.period(), Duration::from_secs(60));

    let res = client.get(lb.url("/clients/test_client")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: ClientLimit = res.json().await.unwrap();
    assert_eq!(body.rate, 20);
    assert_eq!(body.period, "1m");

    let res = client
        .delete(lb.url("/clients?client_id=test_client"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(lb.limiter.get_limit("test_client").is_none());

    let res = client.get(lb.url("/clients/test_client")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    lb.stop().await;
}

#[tokio::test]
async fn test_invalid_client_requests_rejected() {
    let lb = start(None).await;
    let client = common::client();

    let bodies = [
        json!({ "client_id": "global", "rate": 5, "period": "1s" }),
        json!({ "client_id": "", "rate": 5, "period": "1s" }),
        json!({ "client_id": "a", "rate": 0, "period": "1s" }),
        json!({ "client_id": "a", "rate": 5, "period": "0s" }),
        json!({ "client_id": "a", "rate": 5, "period": "soon" }),
        json!({ "client_id": "a", "rate": -1, "period": "1s" }),
    ];
    for body in bodies {
        let res = client.post(lb.url("/clients")).json(&body).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "body: {body}");
    }
    assert!(lb.limiter.get_limit("a").is_none());

    let res = client.delete(lb.url("/clients")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    lb.stop().await;
}

#[tokio::test]
async fn test_admin_routes_require_api_key() {
    let lb = start(Some("secret")).await;
    let client = common::client();

    let res = client.get(lb.url("/admin/backends")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(lb.url("/clients"))
        .bearer_auth("wrong")
        .json(&json!({ "client_id": "a", "rate": 5, "period": "1s" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(lb.url("/admin/backends"))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let backends: Vec<BackendStatus> = res.json().await.unwrap();
    assert_eq!(backends.len(), 1);
    assert!(backends[0].alive);
    assert_eq!(backends[0].active_connections, 0);

    // Proxied traffic is not gated by the key.
    let res = client.get(lb.url("/")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    lb.stop().await;
}
