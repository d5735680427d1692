//! Integration tests for subscription commands and the broadcast loop.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use vm_orchestrator::test_utils::TestOrchestrator;
use vm_orchestrator::{
    Account, ClientCommand, Connection, DiskFormat, DiskRequest, Framebuffer, FramebufferKind,
    FramebufferPort, Listen, MachineRequest, ServerMessage, SessionAccountVerifier, StoragePool,
    SubscriptionClass, SubscriptionTables,
};
use uuid::Uuid;

fn request(title: &str) -> MachineRequest {
    MachineRequest {
        title: title.to_string(),
        description: String::new(),
        tags: Vec::new(),
        memory: 1024,
        vcpus: 1,
        system_disk: DiskRequest {
            name: "system".to_string(),
            size: 8 << 30,
            format: DiskFormat::Qcow2,
            pool: StoragePool::Images,
        },
        additional_disks: Vec::new(),
        install_media: None,
        interfaces: Vec::new(),
        framebuffer: Framebuffer {
            kind: FramebufferKind::Spice,
            port: FramebufferPort::Auto,
            listen: Listen::Network {
                listen_network: "default".to_string(),
            },
        },
        assigned_clients: BTreeSet::new(),
    }
}

fn connection(account: Account) -> (Connection, mpsc::Receiver<ServerMessage>) {
    let (tx, rx) = mpsc::channel(8);
    (Connection::new(account, tx), rx)
}

fn data(message: ServerMessage) -> Vec<Uuid> {
    match message {
        ServerMessage::Data { states } => states.into_keys().collect(),
        other => panic!("Expected DATA, got {:?}", other),
    }
}

#[tokio::test]
async fn test_broadcast_reaches_every_subscriber_until_it_leaves() {
    let env = TestOrchestrator::new().await;
    let id = env
        .orchestrator
        .create_machine(request("shared"), &Account::client("alice"))
        .await
        .unwrap();

    let tables = SubscriptionTables::new();
    let (first, mut first_rx) = connection(Account::client("alice"));
    let (second, mut second_rx) = connection(Account::administrator("root"));
    tables.explicit.subscribe(&first, [id]);
    tables.explicit.subscribe(&second, [id]);
    let broadcaster = env.orchestrator.broadcaster(&tables, SubscriptionClass::Explicit);

    let report = broadcaster.tick().await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.machines_read, 1);
    let first_payload = first_rx.recv().await.unwrap();
    let second_payload = second_rx.recv().await.unwrap();
    assert_eq!(first_payload, second_payload);
    assert_eq!(data(first_payload), vec![id]);

    drop(second_rx);
    let report = broadcaster.tick().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.pruned, 1);
    assert!(!tables.explicit.contains(second.id()));
    assert_eq!(data(first_rx.recv().await.unwrap()), vec![id]);
}

#[tokio::test]
async fn test_owned_and_visible_classes_resolve_per_account() {
    let env = TestOrchestrator::new().await;
    let alice = Account::client("alice");
    let mine = env.orchestrator.create_machine(request("mine"), &alice).await.unwrap();
    let mut assigned = request("assigned");
    assigned.assigned_clients.insert("alice".to_string());
    let theirs = env
        .orchestrator
        .create_machine(assigned, &Account::client("bob"))
        .await
        .unwrap();

    let tables = SubscriptionTables::new();
    let (conn, mut rx) = connection(alice.clone());

    tables.owned.register(&conn);
    env.orchestrator
        .broadcaster(&tables, SubscriptionClass::Owned)
        .tick()
        .await;
    assert_eq!(data(rx.recv().await.unwrap()), vec![mine]);

    tables.visible.register(&conn);
    env.orchestrator
        .broadcaster(&tables, SubscriptionClass::Visible)
        .tick()
        .await;
    let mut expected = vec![mine, theirs];
    expected.sort();
    assert_eq!(data(rx.recv().await.unwrap()), expected);
}

#[tokio::test]
async fn test_deleted_machines_drop_out_of_broadcasts() {
    let env = TestOrchestrator::new().await;
    let id = env
        .orchestrator
        .create_machine(request("gone"), &Account::client("alice"))
        .await
        .unwrap();
    let tables = SubscriptionTables::new();
    let (conn, mut rx) = connection(Account::client("alice"));
    tables.explicit.subscribe(&conn, [id]);

    assert!(env.orchestrator.delete_machine(id).await);
    let report = env
        .orchestrator
        .broadcaster(&tables, SubscriptionClass::Explicit)
        .tick()
        .await;

    assert_eq!(report.delivered, 1);
    assert!(data(rx.recv().await.unwrap()).is_empty());
}

#[tokio::test]
async fn test_service_checks_credentials_against_visibility() {
    let env = TestOrchestrator::new().await;
    let id = env
        .orchestrator
        .create_machine(request("private"), &Account::client("alice"))
        .await
        .unwrap();
    let service = env
        .orchestrator
        .subscription_service(SubscriptionTables::new(), Arc::new(SessionAccountVerifier));
    let (mallory, _mallory_rx) = connection(Account::client("mallory"));
    let (alice, _alice_rx) = connection(Account::client("alice"));

    let not_visible = service
        .handle(
            &mallory,
            ClientCommand::Subscribe {
                resources: vec![id],
                credential: "client:mallory".into(),
            },
        )
        .await;
    assert!(matches!(not_visible, ServerMessage::Reject { .. }));

    let borrowed = service
        .handle(
            &mallory,
            ClientCommand::Subscribe {
                resources: vec![id],
                credential: "client:alice".into(),
            },
        )
        .await;
    assert!(matches!(borrowed, ServerMessage::Reject { .. }));
    assert!(service.tables().explicit.is_empty());

    let accepted = service
        .handle(
            &alice,
            ClientCommand::Subscribe {
                resources: vec![id],
                credential: "client:alice".into(),
            },
        )
        .await;
    assert_eq!(
        accepted,
        ServerMessage::Acknowledge {
            command: "SUBSCRIBE".into()
        }
    );
    assert_eq!(
        service.tables().explicit.resources(alice.id()),
        Some(BTreeSet::from([id]))
    );

    let malformed = service
        .handle(&alice, ClientCommand::SubscribeAll { credential: "auditor:x".into() })
        .await;
    assert!(matches!(malformed, ServerMessage::Reject { .. }));
}

#[tokio::test]
async fn test_credential_cannot_switch_connection_account() {
    let env = TestOrchestrator::new().await;
    let bobs = env
        .orchestrator
        .create_machine(request("bobs"), &Account::client("bob"))
        .await
        .unwrap();
    let tables = SubscriptionTables::new();
    let service = env
        .orchestrator
        .subscription_service(tables.clone(), Arc::new(SessionAccountVerifier));
    let (alice, mut rx) = connection(Account::client("alice"));

    let escalated = service
        .handle(&alice, ClientCommand::SubscribeAll { credential: "administrator:anyone".into() })
        .await;
    assert!(matches!(escalated, ServerMessage::Reject { .. }));
    assert!(tables.visible.is_empty());

    let own = service
        .handle(&alice, ClientCommand::SubscribeAll { credential: "client:alice".into() })
        .await;
    assert!(matches!(own, ServerMessage::Acknowledge { .. }));

    env.orchestrator
        .broadcaster(&tables, SubscriptionClass::Visible)
        .tick()
        .await;
    assert!(!data(rx.recv().await.unwrap()).contains(&bobs));
}

#[tokio::test]
async fn test_service_replace_unsubscribe_and_disconnect() {
    let env = TestOrchestrator::new().await;
    let alice = Account::client("alice");
    let a = env.orchestrator.create_machine(request("a"), &alice).await.unwrap();
    let b = env.orchestrator.create_machine(request("b"), &alice).await.unwrap();
    let service = env
        .orchestrator
        .subscription_service(SubscriptionTables::new(), Arc::new(SessionAccountVerifier));
    let (conn, _rx) = connection(alice);
    let credential = "client:alice".to_string();

    let subscribe = ClientCommand::Subscribe {
        resources: vec![a],
        credential: credential.clone(),
    };
    service.handle(&conn, subscribe).await;
    let replace = ClientCommand::Replace {
        resources: vec![b],
        credential: credential.clone(),
    };
    service.handle(&conn, replace).await;
    assert_eq!(service.tables().explicit.resources(conn.id()), Some(BTreeSet::from([b])));

    service
        .handle(&conn, ClientCommand::SubscribeOwned { credential })
        .await;
    assert!(service.tables().owned.contains(conn.id()));

    service.handle(&conn, ClientCommand::Unsubscribe { resources: vec![b] }).await;
    assert!(!service.tables().explicit.contains(conn.id()));

    service.disconnect(conn.id());
    assert!(service.tables().owned.is_empty());
}
