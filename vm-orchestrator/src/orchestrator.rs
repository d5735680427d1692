use crate::broadcast::Broadcaster;
use crate::config::OrchestratorConfig;
use crate::disk::DiskManager;
use crate::domain::{MachineRequest, MachineSpecification};
use crate::error::Result;
use crate::gateway::GatewayStore;
use crate::hypervisor::{self, Hypervisor, HypervisorHandle};
use crate::lifecycle::{BulkTarget, DeletionReport, LifecycleManager};
use crate::operation::OperationRegistry;
use crate::reconciler::{Direction, StateReconciler, Transition};
use crate::service::{CredentialVerifier, SubscriptionService};
use crate::state::{BootRegistry, MachineState, StateReader};
use crate::store::{Account, MachineStore};
use crate::subscription::{SubscriptionClass, SubscriptionTables};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Every component wired to one hypervisor, one store and one gateway.
#[derive(Debug, Clone)]
pub struct MachineOrchestrator {
    config: OrchestratorConfig,
    hypervisor: HypervisorHandle,
    store: MachineStore,
    gateway: GatewayStore,
    disks: DiskManager,
    operations: OperationRegistry,
    reader: StateReader,
    reconciler: StateReconciler,
    lifecycle: LifecycleManager,
}

impl MachineOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        hypervisor: Arc<dyn Hypervisor>,
        pool: SqlitePool,
        gateway_pool: SqlitePool,
    ) -> Self {
        let hypervisor = HypervisorHandle::new(hypervisor);
        let store = MachineStore::new(pool);
        let gateway =
            GatewayStore::new(gateway_pool, &config.gateway_datasource, &config.gateway_url);
        let disks = DiskManager::new(hypervisor.clone(), config.worker_uid, config.worker_gid);
        let operations = OperationRegistry::new();
        let boots = BootRegistry::new();

        let reader = StateReader::new(
            hypervisor.clone(),
            disks.clone(),
            store.clone(),
            gateway.clone(),
            operations.clone(),
            boots.clone(),
        );
        let reconciler = StateReconciler::new(
            hypervisor.clone(),
            gateway.clone(),
            operations.clone(),
            boots,
            &config,
        );
        let lifecycle = LifecycleManager::new(
            hypervisor.clone(),
            disks.clone(),
            store.clone(),
            reader.clone(),
            reconciler.clone(),
            operations.clone(),
            &config,
        );

        Self {
            config,
            hypervisor,
            store,
            gateway,
            disks,
            operations,
            reader,
            reconciler,
            lifecycle,
        }
    }

    /// Opens the hypervisor named by `config.hypervisor_uri`.
    pub fn connect(
        config: OrchestratorConfig,
        pool: SqlitePool,
        gateway_pool: SqlitePool,
    ) -> Result<Self> {
        let hypervisor = hypervisor::connect(&config.hypervisor_uri)?;
        info!(uri = %config.hypervisor_uri, backend = hypervisor.name(), "Hypervisor connected");
        Ok(Self::new(config, hypervisor, pool, gateway_pool))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn hypervisor(&self) -> &HypervisorHandle {
        &self.hypervisor
    }

    pub fn store(&self) -> &MachineStore {
        &self.store
    }

    pub fn gateway(&self) -> &GatewayStore {
        &self.gateway
    }

    pub fn disks(&self) -> &DiskManager {
        &self.disks
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    pub fn reader(&self) -> &StateReader {
        &self.reader
    }

    pub fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub async fn create_machine(&self, request: MachineRequest, owner: &Account) -> Result<Uuid> {
        self.lifecycle.create_machine(request, owner).await
    }

    pub async fn create_machines_bulk(
        &self,
        request: MachineRequest,
        owner: &Account,
        target: BulkTarget,
    ) -> Result<Vec<Uuid>> {
        self.lifecycle.create_machines_bulk(request, owner, target).await
    }

    pub async fn delete_machine(&self, machine_id: Uuid) -> bool {
        self.lifecycle.delete_machine(machine_id).await
    }

    pub async fn delete_machine_report(&self, machine_id: Uuid) -> DeletionReport {
        self.lifecycle.delete_machine_report(machine_id).await
    }

    pub async fn transfer_ownership(
        &self,
        machine_id: Uuid,
        new_owner: &Account,
    ) -> Result<Account> {
        self.lifecycle.transfer_ownership(machine_id, new_owner).await
    }

    pub async fn start_machine(&self, machine_id: Uuid) -> Result<()> {
        self.reconciler.start_machine(machine_id).await
    }

    pub async fn stop_machine(&self, machine_id: Uuid) -> Result<()> {
        self.reconciler.stop_machine(machine_id).await
    }

    pub async fn await_transition(&self, machine_id: Uuid, direction: Direction) -> Transition {
        self.reconciler.await_transition(machine_id, direction).await
    }

    pub async fn machine_state(&self, machine_id: Uuid) -> Result<MachineState> {
        self.reader.read(machine_id).await
    }

    pub async fn machine_specification(&self, machine_id: Uuid) -> Result<MachineSpecification> {
        self.reader.read_specification(machine_id).await
    }

    /// States of every machine `account` can see.
    pub async fn visible_states(&self, account: &Account) -> Result<BTreeMap<Uuid, MachineState>> {
        let machines = self.store.visible_machines(account).await?;
        Ok(self.reader.read_many(machines).await)
    }

    pub fn broadcaster(
        &self,
        tables: &SubscriptionTables,
        class: SubscriptionClass,
    ) -> Broadcaster {
        Broadcaster::new(tables.get(class).clone(), self.reader.clone())
    }

    pub fn subscription_service(
        &self,
        tables: SubscriptionTables,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> SubscriptionService {
        SubscriptionService::new(tables, self.store.clone(), verifier)
    }
}
