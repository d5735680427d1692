use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::info;
use vm_orchestrator::{MachineOrchestrator, SubscriptionClass, SubscriptionTables};

/// Spawns one broadcast loop per subscription class.
pub fn start_broadcast_tasks(
    orchestrator: &MachineOrchestrator,
    tables: &SubscriptionTables,
    interval: Duration,
) -> Vec<JoinHandle<()>> {
    let handles: Vec<_> = SubscriptionClass::ALL
        .into_iter()
        .map(|class| tokio::spawn(orchestrator.broadcaster(tables, class).run(interval)))
        .collect();

    info!("Broadcast tasks started ({} classes, every {:?})", handles.len(), interval);
    handles
}
