//! Live machine state assembled from the hypervisor, the store and the gateway.

use crate::disk::DiskManager;
use crate::domain::{
    self, DiskFormat, FramebufferKind, MachineSpecification, ParsedDomain, StoragePool,
};
use crate::error::Result;
use crate::gateway::GatewayStore;
use crate::hypervisor::{DomainState, HypervisorHandle};
use crate::operation::OperationRegistry;
use crate::store::{Account, MachineStore};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskState {
    pub uuid: Uuid,
    pub name: String,
    pub size: u64,
    pub occupancy: u64,
    #[serde(rename = "type")]
    pub format: DiskFormat,
    pub pool: StoragePool,
    pub system: bool,
}

/// Snapshot of one machine. Recomputed on every read, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub owner: Account,
    pub assigned_clients: BTreeSet<String>,
    pub disks: Vec<DiskState>,
    pub framebuffer: FramebufferKind,
    pub framebuffer_port: Option<u16>,
    pub state: DomainState,
    pub active: bool,
    /// An operation is in flight for this machine.
    pub loading: bool,
    pub active_users: Vec<String>,
    pub connection_url: Option<String>,
    pub vcpus: u32,
    pub ram_max_kib: u64,
    pub ram_used_kib: u64,
    pub boot_time: Option<DateTime<Utc>>,
}

/// When each running machine was last started by this process.
#[derive(Debug, Clone, Default)]
pub struct BootRegistry {
    boots: Arc<Mutex<HashMap<Uuid, DateTime<Utc>>>>,
}

impl BootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, DateTime<Utc>>> {
        self.boots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, machine_id: Uuid) -> DateTime<Utc> {
        let now = Utc::now();
        self.lock().insert(machine_id, now);
        now
    }

    pub fn clear(&self, machine_id: Uuid) {
        self.lock().remove(&machine_id);
    }

    pub fn get(&self, machine_id: Uuid) -> Option<DateTime<Utc>> {
        self.lock().get(&machine_id).copied()
    }
}

#[derive(Debug, Clone)]
pub struct StateReader {
    hypervisor: HypervisorHandle,
    disks: DiskManager,
    store: MachineStore,
    gateway: GatewayStore,
    operations: OperationRegistry,
    boots: BootRegistry,
}

impl StateReader {
    pub fn new(
        hypervisor: HypervisorHandle,
        disks: DiskManager,
        store: MachineStore,
        gateway: GatewayStore,
        operations: OperationRegistry,
        boots: BootRegistry,
    ) -> Self {
        Self {
            hypervisor,
            disks,
            store,
            gateway,
            operations,
            boots,
        }
    }

    pub fn store(&self) -> &MachineStore {
        &self.store
    }

    pub async fn domain_state(&self, machine_id: Uuid) -> Result<DomainState> {
        Ok(self.hypervisor.call(move |h| h.domain_state(machine_id)).await?)
    }

    pub async fn domain_xml(&self, machine_id: Uuid) -> Result<String> {
        Ok(self.hypervisor.call(move |h| h.domain_xml(machine_id)).await?)
    }

    /// The domain description as the hypervisor holds it, without sizes.
    pub async fn read_description(&self, machine_id: Uuid) -> Result<ParsedDomain> {
        let xml = self.domain_xml(machine_id).await?;
        domain::parse(&xml)
    }

    /// The full specification, disk sizes and assigned clients included.
    pub async fn read_specification(&self, machine_id: Uuid) -> Result<MachineSpecification> {
        let parsed = self.read_description(machine_id).await?;
        let sizes = self
            .disks
            .disk_sizes(parsed.disks().map(|disk| (disk.uuid, disk.pool)))
            .await?;
        let mut specification = parsed.into_specification(&sizes)?.specification;
        specification.assigned_clients = self.store.assigned_clients(machine_id).await?;
        Ok(specification)
    }

    /// Current state of a machine recorded in the store.
    #[instrument(skip(self), fields(machine_id = %machine_id))]
    pub async fn read(&self, machine_id: Uuid) -> Result<MachineState> {
        let owner = self.store.require_owner(machine_id).await?;
        let parsed = self.read_description(machine_id).await?;
        let info = self.hypervisor.call(move |h| h.domain_info(machine_id)).await?;

        let usage = join_all(
            parsed
                .disks()
                .map(|disk| self.disks.volume_info(disk.uuid, disk.pool)),
        )
        .await;
        let disks = parsed
            .disks()
            .zip(usage)
            .map(|(disk, usage)| {
                usage.map(|usage| DiskState {
                    uuid: disk.uuid,
                    name: disk.name.clone(),
                    size: usage.capacity,
                    occupancy: usage.allocation,
                    format: disk.format,
                    pool: disk.pool,
                    system: disk.uuid == parsed.system_disk.uuid,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let protocol = parsed.framebuffer.kind.as_str();
        let assigned_clients = self.store.assigned_clients(machine_id).await?;
        let connection_url = self.gateway.connection_url(machine_id, protocol).await?;
        let active_users = self.gateway.active_users(machine_id, protocol).await?;
        let active = info.state.is_active();

        Ok(MachineState {
            id: machine_id,
            title: parsed.title,
            description: parsed.description,
            tags: parsed.tags,
            owner,
            assigned_clients,
            disks,
            framebuffer: parsed.framebuffer.kind,
            framebuffer_port: parsed.live_port,
            state: info.state,
            active,
            loading: self.operations.is_busy(machine_id),
            active_users,
            connection_url,
            vcpus: info.vcpus,
            ram_max_kib: info.max_memory_kib,
            ram_used_kib: info.memory_kib,
            boot_time: if active { self.boots.get(machine_id) } else { None },
        })
    }

    /// Reads several machines concurrently, leaving out the ones that cannot
    /// be read.
    pub async fn read_many(
        &self,
        machine_ids: impl IntoIterator<Item = Uuid>,
    ) -> BTreeMap<Uuid, MachineState> {
        let reads = machine_ids
            .into_iter()
            .map(|id| async move { (id, self.read(id).await) });
        join_all(reads)
            .await
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(state) => Some((id, state)),
                Err(e) => {
                    debug!(machine_id = %id, error = %e, "Skipping unreadable machine");
                    None
                }
            })
            .collect()
    }
}
