mod test_harness;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use centrum::dashboard::{router, DashboardState};
use centrum::model::settings::{CentrumMode, CentrumSettings};
use centrum::node::Node;
use test_harness::{police_dispatch, staffed_unit, TestEnv, JOB};

/// Helper to create the dashboard router over a node
fn create_test_app(node: &Node) -> Router {
    router(DashboardState {
        node_id: node.config.node_id,
        replica: node.replica,
        dispatches: node.dispatches.clone(),
        settings: node.settings.clone(),
        bots: node.bots.clone(),
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn post_json(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_status_endpoint() {
    let env = TestEnv::new();
    let node = env.node();
    police_dispatch(&node, 0.0, 0.0).await;
    staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;

    let response = create_test_app(&node).oneshot(get("/api/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["node_id"], 1);
    assert_eq!(json["replica"], node.replica.to_string());
    assert_eq!(json["dispatches"], 1);
    assert_eq!(json["units"], 1);
    assert!(json["bots"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_dispatch_returns_created() {
    let env = TestEnv::new();
    let node = env.node();

    let response = create_test_app(&node)
        .oneshot(post_json(
            "/api/jobs/police/dispatches",
            json!({
                "message": "Shots fired",
                "x": 10.5,
                "y": -3.0,
                "jobs": ["ambulance"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    assert_eq!(json["message"], "Shots fired");
    assert_eq!(json["jobs"], json!(["police", "ambulance"]));
    assert_eq!(json["status"]["status"], "NEW");

    let id = json["id"].as_u64().unwrap();
    assert!(node.dispatches.get(id).await.is_ok());
}

#[tokio::test]
async fn test_list_dispatches_hides_anonymous_creator() {
    let env = TestEnv::new();
    let node = env.node();
    let app = create_test_app(&node);

    let created = app
        .clone()
        .oneshot(post_json(
            "/api/jobs/police/dispatches",
            json!({ "message": "Tip", "x": 0.0, "y": 0.0, "anon": true, "creator_id": 12 }),
        ))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);

    let response = app.oneshot(get("/api/jobs/police/dispatches")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let dispatches = json.as_array().unwrap();
    assert_eq!(dispatches.len(), 1);
    assert!(dispatches[0]["creator_id"].is_null());

    // The stored record keeps the creator
    let id = dispatches[0]["id"].as_u64().unwrap();
    assert_eq!(node.dispatches.get(id).await.unwrap().creator_id, Some(12));
}

#[tokio::test]
async fn test_take_reports_per_dispatch_failures() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;

    let response = create_test_app(&node)
        .oneshot(post_json(
            "/api/jobs/police/dispatches/take",
            json!({
                "unit_id": unit.id,
                "dispatch_ids": [dsp.id, 999],
                "response": "ACCEPT",
                "user_id": 7,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["dispatches"].as_array().unwrap().len(), 1);
    assert_eq!(json["dispatches"][0]["status"]["status"], "UNIT_ACCEPTED");
    assert_eq!(json["failures"][0]["dispatch_id"], 999);
    assert_eq!(json["failures"][0]["kind"], "not_found");
}

#[tokio::test]
async fn test_take_under_central_command_is_rejected() {
    let env = TestEnv::new();
    let node = env.node();
    let unit = staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;
    let dsp = police_dispatch(&node, 0.0, 0.0).await;
    node.settings
        .update(
            CentrumSettings::new(JOB).with_mode(CentrumMode::CentralCommand, CentrumMode::Manual),
        )
        .await
        .unwrap();

    let response = create_test_app(&node)
        .oneshot(post_json(
            "/api/jobs/police/dispatches/take",
            json!({ "unit_id": unit.id, "dispatch_ids": [dsp.id], "response": "ACCEPT" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["kind"], "mode_forbids_action");
}

#[tokio::test]
async fn test_units_and_settings_endpoints() {
    let env = TestEnv::new();
    let node = env.node();
    staffed_unit(&env, &node, JOB, "Adam 1", &[7]).await;

    let app = create_test_app(&node);
    let units = body_json(app.clone().oneshot(get("/api/jobs/police/units")).await.unwrap()).await;
    assert_eq!(units.as_array().unwrap().len(), 1);
    assert_eq!(units[0]["name"], "Adam 1");

    let settings = body_json(app.oneshot(get("/api/jobs/police/settings")).await.unwrap()).await;
    assert_eq!(settings["job"], "police");
    assert_eq!(settings["enabled"], false);
}
