//! Integration tests for start, stop and transition polling.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use vm_orchestrator::hypervisor::Fault;
use vm_orchestrator::test_utils::{
    seed_active_user, seed_gateway_connection, test_config, TestOrchestrator,
};
use vm_orchestrator::{
    Account, Direction, DiskFormat, DiskRequest, DomainState, Framebuffer, FramebufferKind,
    FramebufferPort, Listen, MachineRequest, OrchestratorError, ShutdownMode, StoragePool,
    Transition,
};
use uuid::Uuid;

fn request() -> MachineRequest {
    MachineRequest {
        title: "desktop".to_string(),
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

async fn machine(env: &TestOrchestrator) -> Uuid {
    env.orchestrator
        .create_machine(request(), &Account::client("alice"))
        .await
        .expect("Failed to create machine")
}

#[tokio::test]
async fn test_start_publishes_live_port_to_gateway() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;
    let connection = seed_gateway_connection(&env.pool, id, "vnc", 0).await;
    seed_active_user(&env.pool, connection, "alice").await;

    env.orchestrator.start_machine(id).await.unwrap();

    assert_eq!(env.orchestrator.gateway().port(id, "vnc").await.unwrap(), Some(5900));

    let state = env.orchestrator.machine_state(id).await.unwrap();
    assert_eq!(state.state, DomainState::Running);
    assert!(state.active);
    assert_eq!(state.framebuffer_port, Some(5900));
    assert!(state.boot_time.is_some());
    assert_eq!(state.active_users, vec!["alice".to_string()]);
    assert_eq!(state.connection_url, Some(env.orchestrator.gateway().client_url(connection)));
}

#[tokio::test]
async fn test_start_without_gateway_connection_still_succeeds() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;

    env.orchestrator.start_machine(id).await.unwrap();

    assert_eq!(env.orchestrator.gateway().port(id, "vnc").await.unwrap(), None);
    assert_eq!(env.hypervisor.start_calls(id), 1);
}

#[tokio::test]
async fn test_concurrent_starts_issue_one_start_command() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;

    let (first, second) = tokio::join!(
        env.orchestrator.start_machine(id),
        env.orchestrator.start_machine(id)
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(OrchestratorError::OperationInProgress { .. }))));
    assert_eq!(env.hypervisor.start_calls(id), 1);
}

#[tokio::test]
async fn test_start_of_running_machine_is_rejected() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;
    env.orchestrator.start_machine(id).await.unwrap();

    let result = env.orchestrator.start_machine(id).await;

    assert!(matches!(result, Err(OrchestratorError::InvalidState(_))));
    assert_eq!(env.hypervisor.start_calls(id), 1);
}

#[tokio::test]
async fn test_start_that_never_settles_times_out() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;
    env.hypervisor.inject(Fault::HangOnStart(id));

    let started = Instant::now();
    let result = env.orchestrator.start_machine(id).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(OrchestratorError::TransitionFailed(_))));
    assert!(elapsed >= Duration::from_millis(300), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "returned after {:?}", elapsed);
    assert!(env.orchestrator.operations().is_empty());
}

#[tokio::test]
async fn test_start_that_crashes_reports_halt() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;
    env.hypervisor.inject(Fault::CrashOnStart(id));

    let result = env.orchestrator.start_machine(id).await;

    assert!(matches!(result, Err(OrchestratorError::TransitionFailed(_))));
}

#[tokio::test]
async fn test_await_transition_returns_on_terminal_state() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;

    let orchestrator = &env.orchestrator;
    assert_eq!(
        orchestrator.await_transition(id, Direction::PowerOff).await,
        Transition::Halted
    );
    assert_eq!(
        orchestrator.await_transition(id, Direction::PowerOn).await,
        Transition::Halted
    );

    env.hypervisor.set_state(id, DomainState::Running);
    assert_eq!(
        orchestrator.await_transition(id, Direction::PowerOn).await,
        Transition::Running
    );
}

#[tokio::test]
async fn test_await_transition_gives_up_after_timeout() {
    let mut config = test_config();
    config.transition_timeout_ms = 200;
    let env = TestOrchestrator::with_config(config).await;
    let id = machine(&env).await;
    env.hypervisor.set_state(id, DomainState::Paused);

    let started = Instant::now();
    let transition = env.orchestrator.await_transition(id, Direction::PowerOn).await;

    assert_eq!(transition, Transition::Unknown);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_stop_uses_first_accepted_shutdown_mode() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;
    seed_gateway_connection(&env.pool, id, "vnc", 0).await;
    env.orchestrator.start_machine(id).await.unwrap();

    env.orchestrator.stop_machine(id).await.unwrap();

    assert_eq!(env.hypervisor.shutdown_modes(id), vec![ShutdownMode::GuestAgent]);
    assert_eq!(env.hypervisor.destroy_calls(id), 0);
    assert_eq!(env.orchestrator.gateway().port(id, "vnc").await.unwrap(), Some(0));

    let state = env.orchestrator.machine_state(id).await.unwrap();
    assert_eq!(state.state, DomainState::Shutoff);
    assert_eq!(state.framebuffer_port, None);
    assert_eq!(state.boot_time, None);
}

#[tokio::test]
async fn test_stop_falls_through_modes_then_destroys() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;
    env.orchestrator.start_machine(id).await.unwrap();
    for mode in ShutdownMode::DESCENDING {
        env.hypervisor.inject(Fault::IgnoreShutdown(mode));
    }

    env.orchestrator.stop_machine(id).await.unwrap();

    assert_eq!(env.hypervisor.shutdown_modes(id), ShutdownMode::DESCENDING.to_vec());
    assert_eq!(env.hypervisor.destroy_calls(id), 1);
    assert_eq!(
        env.orchestrator.machine_state(id).await.unwrap().state,
        DomainState::Shutoff
    );
}

#[tokio::test]
async fn test_stop_of_stopped_machine_is_rejected() {
    let env = TestOrchestrator::new().await;
    let id = machine(&env).await;

    let result = env.orchestrator.stop_machine(id).await;

    assert!(matches!(result, Err(OrchestratorError::InvalidState(_))));
    assert!(env.hypervisor.shutdown_modes(id).is_empty());
}
