use crate::config::OrchestratorConfig;
use crate::gateway::connection_name;
use crate::hypervisor::MemoryHypervisor;
use crate::orchestrator::MachineOrchestrator;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    // The path is relative to the crate root.
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Config with short timings so transition tests finish quickly.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        hypervisor_uri: "memory://".to_string(),
        domain_type: "kvm".to_string(),
        poll_interval_ms: 10,
        transition_timeout_ms: 300,
        shutdown_window_ms: 100,
        worker_uid: 107,
        worker_gid: 107,
        gateway_datasource: "postgresql".to_string(),
        gateway_url: "https://gateway.test/guacamole".to_string(),
        max_bulk_count: 8,
    }
}

/// Inserts a gateway connection for `machine_id` with its port parameter and
/// returns the connection id.
pub async fn seed_gateway_connection(
    pool: &SqlitePool,
    machine_id: Uuid,
    protocol: &str,
    port: u16,
) -> i64 {
    let connection_id: i64 = sqlx::query_scalar(
        "INSERT INTO gateway_connection (connection_name, protocol) VALUES (?, ?)
         RETURNING connection_id",
    )
    .bind(connection_name(machine_id, protocol))
    .bind(protocol)
    .fetch_one(pool)
    .await
    .expect("Failed to insert gateway connection");

    sqlx::query(
        "INSERT INTO gateway_connection_parameter (connection_id, parameter_name, parameter_value)
         VALUES (?, 'port', ?)",
    )
    .bind(connection_id)
    .bind(port.to_string())
    .execute(pool)
    .await
    .expect("Failed to insert gateway port");

    connection_id
}

/// Marks `username` as connected through `connection_id`.
pub async fn seed_active_user(pool: &SqlitePool, connection_id: i64, username: &str) {
    sqlx::query(
        "INSERT INTO gateway_active_connection (connection_id, username, start_date)
         VALUES (?, ?, ?)",
    )
    .bind(connection_id)
    .bind(username)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await
    .expect("Failed to insert active connection");
}

/// An orchestrator over a [`MemoryHypervisor`] with every pool active.
pub struct TestOrchestrator {
    pub hypervisor: Arc<MemoryHypervisor>,
    pub pool: SqlitePool,
    pub orchestrator: MachineOrchestrator,
}

impl TestOrchestrator {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: OrchestratorConfig) -> Self {
        let hypervisor = Arc::new(MemoryHypervisor::with_default_pools());
        for pool in crate::domain::StoragePool::ALL {
            hypervisor.add_pool(pool.as_str(), true);
        }
        let pool = create_test_db().await;
        let orchestrator =
            MachineOrchestrator::new(config, hypervisor.clone(), pool.clone(), pool.clone());
        Self {
            hypervisor,
            pool,
            orchestrator,
        }
    }
}
