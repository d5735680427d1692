//! Integration tests for REST API endpoints
//!
//! Tests machine creation, listing, power commands, ownership and deletion
//! through the HTTP surface.

mod common;

use axum::http::StatusCode;
use common::{extract_json_body, machine_request, TestClient};
use std::collections::BTreeMap;
use uuid::Uuid;
use vm_api::routes::machines::{CreatedMachines, TransferOwnerResponse};
use vm_api::routes::subscriptions::handle_frame;
use vm_orchestrator::{
    Account, ClientCommand, Connection, DomainState, MachineState, ServerMessage, SubscriptionClass,
};

fn alice() -> Account {
    Account::client("alice")
}

fn root() -> Account {
    Account::administrator("root")
}

#[tokio::test]
async fn test_health_needs_no_auth() {
    let client = TestClient::new().await;

    let response = client.request::<()>("GET", "/health/ready", None, None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = extract_json_body(response).await;
    assert_eq!(json["status"], "ready");
    assert_eq!(json["hypervisor"], "memory");
}

#[tokio::test]
async fn test_create_machine_endpoint() {
    let client = TestClient::new().await;

    let response = client.post("/api/v1/machines", &alice(), &machine_request("web")).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let created: CreatedMachines = extract_json_body(response).await;
    assert_eq!(created.ids.len(), 1);

    let owner = client
        .env
        .orchestrator
        .store()
        .owner(created.ids[0])
        .await
        .unwrap();
    assert_eq!(owner, Some(alice()));
}

#[tokio::test]
async fn test_create_machine_without_auth_fails() {
    let client = TestClient::new().await;

    let response = client
        .request("POST", "/api/v1/machines", None, Some(&machine_request("web")))
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(client.env.hypervisor.domain_count(), 0);
}

#[tokio::test]
async fn test_create_invalid_machine_returns_400() {
    let client = TestClient::new().await;
    let mut req = machine_request("web");
    req.memory = 0;

    let response = client.post("/api/v1/machines", &alice(), &req).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json: serde_json::Value = extract_json_body(response).await;
    assert!(json["error"].as_str().unwrap().contains("memory"));
}

#[tokio::test]
async fn test_list_machines_is_scoped_to_caller() {
    let client = TestClient::new().await;
    let mine = client.fixture_machine(&alice(), &[]).await;
    let assigned = client.fixture_machine(&Account::client("bob"), &["alice"]).await;
    let hidden = client.fixture_machine(&Account::client("bob"), &[]).await;

    let response = client.get("/api/v1/machines", &alice()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let states: BTreeMap<Uuid, MachineState> = extract_json_body(response).await;
    assert!(states.contains_key(&mine));
    assert!(states.contains_key(&assigned));
    assert!(!states.contains_key(&hidden));

    let response = client.get("/api/v1/machines", &root()).await;
    let states: BTreeMap<Uuid, MachineState> = extract_json_body(response).await;
    assert_eq!(states.len(), 3);
}

#[tokio::test]
async fn test_get_machine_checks_visibility() {
    let client = TestClient::new().await;
    let id = client.fixture_machine(&alice(), &[]).await;
    let uri = format!("/api/v1/machines/{}", id);

    let response = client.get(&uri, &alice()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let state: MachineState = extract_json_body(response).await;
    assert_eq!(state.id, id);
    assert_eq!(state.owner, alice());

    let response = client.get(&uri, &Account::client("mallory")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client.get(&format!("/api/v1/machines/{}", Uuid::new_v4()), &alice()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_and_stop_endpoints() {
    let client = TestClient::new().await;
    let id = client.fixture_machine(&alice(), &[]).await;

    let response = client.post_empty(&format!("/api/v1/machines/{}/start", id), &alice()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let state: MachineState = extract_json_body(response).await;
    assert_eq!(state.state, DomainState::Running);

    let response = client.post_empty(&format!("/api/v1/machines/{}/start", id), &alice()).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = client.post_empty(&format!("/api/v1/machines/{}/stop", id), &alice()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let state: MachineState = extract_json_body(response).await;
    assert_eq!(state.state, DomainState::Shutoff);
}

#[tokio::test]
async fn test_bulk_requires_administrator_and_one_target() {
    let client = TestClient::new().await;
    let mut body = serde_json::to_value(machine_request("lab")).unwrap();
    body["count"] = serde_json::json!(2);

    let response = client.post("/api/v1/machines/bulk", &alice(), &body).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client.post("/api/v1/machines/bulk", &root(), &body).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: CreatedMachines = extract_json_body(response).await;
    assert_eq!(created.ids.len(), 2);

    body["group"] = serde_json::json!("course-101");
    let response = client.post("/api/v1/machines/bulk", &root(), &body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(client.env.hypervisor.domain_count(), 2);
}

#[tokio::test]
async fn test_bulk_count_above_limit_returns_400() {
    let client = TestClient::new().await;
    let mut body = serde_json::to_value(machine_request("lab")).unwrap();
    body["count"] = serde_json::json!(u64::MAX);

    let response = client.post("/api/v1/machines/bulk", &root(), &body).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(client.env.hypervisor.volume_count(), 0);
}

#[tokio::test]
async fn test_transfer_owner_endpoint() {
    let client = TestClient::new().await;
    let id = client.fixture_machine(&alice(), &[]).await;
    let uri = format!("/api/v1/machines/{}/owner", id);
    let body = serde_json::json!({ "owner": { "kind": "client", "id": "erin" } });

    let response = client.put(&uri, &Account::client("bob"), &body).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client.put(&uri, &alice(), &body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let transfer: TransferOwnerResponse = extract_json_body(response).await;
    assert_eq!(transfer.previous_owner, alice());
    assert_eq!(transfer.owner, Account::client("erin"));
}

#[tokio::test]
async fn test_delete_machine_returns_report() {
    let client = TestClient::new().await;
    let id = client.fixture_machine(&alice(), &["bob"]).await;
    let uri = format!("/api/v1/machines/{}", id);

    // Assigned clients may use but not delete
    let response = client.delete(&uri, &Account::client("bob")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client.delete(&uri, &alice()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let report: serde_json::Value = extract_json_body(response).await;
    assert_eq!(report["machine_id"], id.to_string());
    let steps = report["steps"].as_array().unwrap();
    assert!(steps.iter().all(|step| step["outcome"] != "failed"));

    let response = client.get(&uri, &alice()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_subscription_frames_are_applied() {
    let client = TestClient::new().await;
    let id = client.fixture_machine(&alice(), &[]).await;
    let (tx, _rx) = tokio::sync::mpsc::channel(4);
    let connection = Connection::new(alice(), tx);

    let frame = serde_json::to_string(&ClientCommand::Subscribe {
        resources: vec![id],
        credential: "client:alice".into(),
    })
    .unwrap();
    let reply = handle_frame(&client.state, &connection, &frame).await;
    assert_eq!(
        reply,
        ServerMessage::Acknowledge {
            command: "SUBSCRIBE".into()
        }
    );
    assert!(client.state.subscriptions.tables().explicit.contains(connection.id()));

    let reply = handle_frame(&client.state, &connection, r#"{"type":"DANCE"}"#).await;
    assert!(matches!(reply, ServerMessage::Reject { .. }));
}

#[tokio::test]
async fn test_client_credential_cannot_claim_administrator_subscription() {
    let client = TestClient::new().await;
    client.fixture_machine(&Account::client("bob"), &[]).await;
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let connection = Connection::new(alice(), tx);

    let frame = serde_json::to_string(&ClientCommand::SubscribeAll {
        credential: "administrator:anyone".into(),
    })
    .unwrap();
    let reply = handle_frame(&client.state, &connection, &frame).await;
    assert!(matches!(reply, ServerMessage::Reject { .. }));
    assert!(client.state.subscriptions.tables().visible.is_empty());

    let frame = serde_json::to_string(&ClientCommand::SubscribeAll {
        credential: "client:alice".into(),
    })
    .unwrap();
    let reply = handle_frame(&client.state, &connection, &frame).await;
    assert!(matches!(reply, ServerMessage::Acknowledge { .. }));

    let tables = client.state.subscriptions.tables().clone();
    let report = client
        .env
        .orchestrator
        .broadcaster(&tables, SubscriptionClass::Visible)
        .tick()
        .await;
    assert_eq!(report.delivered, 1);
    match rx.recv().await.unwrap() {
        ServerMessage::Data { states } => assert!(states.is_empty()),
        other => panic!("Expected DATA, got {:?}", other),
    }
}
