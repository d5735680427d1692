//! Common test utilities and helpers for vm-api tests

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use std::collections::BTreeSet;
use tower::ServiceExt;
use uuid::Uuid;
use vm_api::{create_app, AppState};
use vm_orchestrator::test_utils::TestOrchestrator;
use vm_orchestrator::{
    Account, DiskFormat, DiskRequest, Framebuffer, FramebufferKind, FramebufferPort, Listen,
    MachineRequest, StoragePool, SubscriptionTables,
};

/// App plus the orchestrator environment behind it
pub struct TestClient {
    pub env: TestOrchestrator,
    pub state: AppState,
    pub app: Router,
}

impl TestClient {
    pub async fn new() -> Self {
        let env = TestOrchestrator::new().await;
        let state = AppState::new(env.orchestrator.clone(), SubscriptionTables::new(), 8);
        let app = create_app(state.clone());
        Self { env, state, app }
    }

    /// Send a request to the API
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        // Clone the app to allow reuse (Router is cheap to clone)
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn request<T: serde::Serialize>(
        &self,
        method: &str,
        uri: &str,
        user: Option<&Account>,
        body: Option<&T>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(account) = user {
            builder = builder
                .header("x-vm-user", account.id.as_str())
                .header("x-vm-account-kind", account.kind.as_str());
        }
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_string(body).expect("Failed to serialize request body"))
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    pub async fn get(&self, uri: &str, user: &Account) -> Response<Body> {
        self.request::<()>("GET", uri, Some(user), None).await
    }

    pub async fn post<T: serde::Serialize>(
        &self,
        uri: &str,
        user: &Account,
        body: &T,
    ) -> Response<Body> {
        self.request("POST", uri, Some(user), Some(body)).await
    }

    pub async fn post_empty(&self, uri: &str, user: &Account) -> Response<Body> {
        self.request::<()>("POST", uri, Some(user), None).await
    }

    pub async fn put<T: serde::Serialize>(
        &self,
        uri: &str,
        user: &Account,
        body: &T,
    ) -> Response<Body> {
        self.request("PUT", uri, Some(user), Some(body)).await
    }

    pub async fn delete(&self, uri: &str, user: &Account) -> Response<Body> {
        self.request::<()>("DELETE", uri, Some(user), None).await
    }

    /// Fixture: a machine owned by `owner`
    pub async fn fixture_machine(&self, owner: &Account, assigned: &[&str]) -> Uuid {
        let mut req = machine_request("fixture");
        req.assigned_clients = assigned.iter().map(|c| c.to_string()).collect();
        self.env
            .orchestrator
            .create_machine(req, owner)
            .await
            .expect("Failed to create fixture machine")
    }
}

pub fn machine_request(title: &str) -> MachineRequest {
    MachineRequest {
        title: title.to_string(),
        description: String::new(),
        tags: Vec::new(),
        memory: 1024,
        vcpus: 1,
        system_disk: DiskRequest {
            name: "system".to_string(),
            size: 10 << 30,
            format: DiskFormat::Qcow2,
            pool: StoragePool::Images,
        },
        additional_disks: Vec::new(),
        install_media: None,
        interfaces: Vec::new(),
        framebuffer: Framebuffer {
            kind: FramebufferKind::Vnc,
            port: FramebufferPort::Auto,
            listen: Listen::Address {
                listen_address: "0.0.0.0".to_string(),
            },
        },
        assigned_clients: BTreeSet::new(),
    }
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: axum::response::Response) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}
