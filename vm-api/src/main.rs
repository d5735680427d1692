use anyhow::Result;
use tracing::info;
use vm_api::{create_app, start_broadcast_tasks, tracing_init, AppState, Config};
use vm_orchestrator::db::{backup_database, create_pool, run_migrations};
use vm_orchestrator::{MachineOrchestrator, SubscriptionTables};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init::init()?;

    info!("Starting vm-api service...");

    // Load configuration
    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, hypervisor={}",
        config.bind_addr,
        config.db_path.display(),
        config.orchestrator.hypervisor_uri
    );

    // Database setup
    let db_path = &config.db_path;

    // Backup before migrations
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    // The gateway owns its schema; only connect to it.
    let gateway_pool = match &config.gateway_db_path {
        Some(path) => {
            info!("Gateway database: {}", path.display());
            create_pool(path).await?
        }
        None => pool.clone(),
    };

    let orchestrator =
        MachineOrchestrator::connect(config.orchestrator.clone(), pool, gateway_pool)?;

    let tables = SubscriptionTables::new();
    start_broadcast_tasks(&orchestrator, &tables, config.broadcast_interval());

    let app = create_app(AppState::new(orchestrator, tables, config.subscriber_buffer));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
