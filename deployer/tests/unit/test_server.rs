//! HTTP routes over the harness coordinator

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use verend::server::serve::router;
use verend::server::state::ServerState;

use crate::common::{Harness, HarnessOptions, TOKEN};

fn app(h: &Harness) -> Router {
    router(Arc::new(ServerState::new(h.coordinator.clone())))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = tokio_test::assert_ok!(app.oneshot(request).await);
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn deploy_request(project_id: &str, owner_id: &str, token: &str) -> Request<Body> {
    Request::post(format!("/projects/{}/deployments", project_id))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "ownerId": owner_id, "credentialToken": token }).to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn test_request_and_read_back() {
    let h = Harness::new(HarnessOptions::default()).await;

    let (status, body) = send(app(&h), deploy_request("p1", "u1", TOKEN)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["sequenceNumber"], 1);
    let id = body["deploymentId"].as_str().unwrap().to_string();

    let (status, body) = send(
        app(&h),
        Request::get(format!("/deployments/{}", id)).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "analyzing");
    assert_eq!(body["projectId"], "p1");
    assert!(body.get("appliedEvents").is_none());
    assert!(!body.to_string().contains(TOKEN));

    let (status, body) = send(
        app(&h),
        Request::get("/projects/p1/deployments").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_request_errors_map_to_status() {
    let h = Harness::new(HarnessOptions::default()).await;

    let (status, _) = send(app(&h), deploy_request("p1", "intruder", TOKEN)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(app(&h), deploy_request("missing", "u1", TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(app(&h), deploy_request("p1", "u1", "")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = send(
        app(&h),
        Request::get("/deployments/nope").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new(HarnessOptions::default()).await;
    let (status, body) = send(app(&h), Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "verend");
}
