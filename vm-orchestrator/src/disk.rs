//! Backing volumes in the hypervisor's storage pools.

use crate::domain::xml::Element;
use crate::domain::{Disk, DiskRequest, MachineRequest, MachineSpecification, StoragePool};
use crate::error::{OrchestratorError, Result};
use crate::hypervisor::{HypervisorHandle, VolumeInfo};
use futures_util::future::join_all;
use std::collections::HashMap;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const VOLUME_MODE: &str = "0660";

#[derive(Debug, Clone)]
pub struct DiskManager {
    hypervisor: HypervisorHandle,
    worker_uid: u32,
    worker_gid: u32,
}

impl DiskManager {
    pub fn new(hypervisor: HypervisorHandle, worker_uid: u32, worker_gid: u32) -> Self {
        Self {
            hypervisor,
            worker_uid,
            worker_gid,
        }
    }

    fn volume_xml(&self, disk: &Disk) -> String {
        Element::new("volume")
            .child(Element::text("name", disk.volume_name()))
            .child(Element::text("capacity", disk.size).attr("unit", "bytes"))
            .child(
                Element::new("target")
                    .child(Element::new("format").attr("type", disk.format))
                    .child(
                        Element::new("permissions")
                            .child(Element::text("owner", self.worker_uid))
                            .child(Element::text("group", self.worker_gid))
                            .child(Element::text("mode", VOLUME_MODE)),
                    ),
            )
            .render()
    }

    async fn ensure_pool_active(&self, pool: StoragePool) -> Result<()> {
        let name = pool.as_str();
        let active = self.hypervisor.call(move |h| h.pool_is_active(name)).await?;

        if !active {
            info!(pool = %pool, "Activating inactive storage pool");
            self.hypervisor.call(move |h| h.activate_pool(name)).await?;
        }
        Ok(())
    }

    /// Volumes in `pool` whose name starts with `uuid`.
    async fn matching_volumes(&self, uuid: Uuid, pool: StoragePool) -> Result<Vec<String>> {
        self.ensure_pool_active(pool).await?;
        let name = pool.as_str();
        let prefix = uuid.to_string();
        let volumes = self.hypervisor.call(move |h| h.list_volumes(name)).await?;
        Ok(volumes
            .into_iter()
            .filter(|v| v.starts_with(&prefix))
            .collect())
    }

    /// Creates a volume for `request` and returns the UUID naming it.
    #[instrument(skip(self, request), fields(disk = %request.name, pool = %request.pool))]
    pub async fn create_disk(&self, request: &DiskRequest) -> Result<Uuid> {
        let uuid = Uuid::new_v4();
        let disk = Disk::from_request(uuid, request);
        self.ensure_pool_active(disk.pool).await?;

        let xml = self.volume_xml(&disk);
        let name = disk.pool.as_str();
        self.hypervisor.call(move |h| h.create_volume(name, &xml)).await?;

        debug!(volume = %disk.volume_name(), size = disk.size, "Created volume");
        Ok(uuid)
    }

    /// Deletes every volume named after `uuid`. Reports failure instead of
    /// raising; also false when nothing matched.
    #[instrument(skip(self), fields(uuid = %uuid, pool = %pool))]
    pub async fn delete_disk(&self, uuid: Uuid, pool: StoragePool) -> bool {
        let volumes = match self.matching_volumes(uuid, pool).await {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!(error = %e, "Cannot list volumes for deletion");
                return false;
            }
        };
        if volumes.is_empty() {
            warn!("No volume to delete");
            return false;
        }

        let name = pool.as_str();
        let mut deleted_all = true;
        for volume in volumes {
            let target = volume.clone();
            match self.hypervisor.call(move |h| h.delete_volume(name, &target)).await {
                Ok(()) => debug!(volume = %volume, "Deleted volume"),
                Err(e) => {
                    warn!(volume = %volume, error = %e, "Failed to delete volume");
                    deleted_all = false;
                }
            }
        }
        deleted_all
    }

    /// Capacity and allocation of the volume named after `uuid`.
    pub async fn volume_info(&self, uuid: Uuid, pool: StoragePool) -> Result<VolumeInfo> {
        let volume = self
            .matching_volumes(uuid, pool)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("volume {} in pool {}", uuid, pool))
            })?;
        let name = pool.as_str();
        Ok(self.hypervisor.call(move |h| h.volume_info(name, &volume)).await?)
    }

    /// Capacity in bytes.
    pub async fn disk_size(&self, uuid: Uuid, pool: StoragePool) -> Result<u64> {
        Ok(self.volume_info(uuid, pool).await?.capacity)
    }

    /// Bytes actually allocated on the host.
    pub async fn disk_occupancy(&self, uuid: Uuid, pool: StoragePool) -> Result<u64> {
        Ok(self.volume_info(uuid, pool).await?.allocation)
    }

    /// Capacities of several volumes, looked up concurrently.
    pub async fn disk_sizes(
        &self,
        disks: impl IntoIterator<Item = (Uuid, StoragePool)>,
    ) -> Result<HashMap<Uuid, u64>> {
        let lookups = disks.into_iter().map(|(uuid, pool)| async move {
            self.volume_info(uuid, pool).await.map(|info| (uuid, info))
        });
        join_all(lookups)
            .await
            .into_iter()
            .map(|result| result.map(|(uuid, info)| (uuid, info.capacity)))
            .collect()
    }

    /// Deletes every disk of `spec`, logging individual failures. Returns the
    /// number of disks that could not be deleted.
    pub async fn cleanup_all(&self, spec: &MachineSpecification) -> usize {
        self.delete_all(spec.disks()).await
    }

    async fn delete_all<'a>(&self, disks: impl Iterator<Item = &'a Disk>) -> usize {
        let deletions = disks.map(|disk| async move {
            let deleted = self.delete_disk(disk.uuid, disk.pool).await;
            if !deleted {
                error!(volume = %disk.volume_name(), pool = %disk.pool, "Disk cleanup failed");
            }
            deleted
        });
        join_all(deletions)
            .await
            .into_iter()
            .filter(|deleted| !deleted)
            .count()
    }

    /// Allocates every disk of `request` concurrently. If any allocation
    /// fails, waits for the rest, deletes the disks that were created and
    /// returns the first error.
    #[instrument(skip(self, request), fields(title = %request.title))]
    pub async fn allocate_all(&self, request: MachineRequest) -> Result<MachineSpecification> {
        let results = join_all(request.disks().map(|disk| self.create_disk(disk))).await;

        let mut disks = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (result, disk_request) in results.into_iter().zip(request.disks()) {
            match result {
                Ok(uuid) => disks.push(Disk::from_request(uuid, disk_request)),
                Err(e) => {
                    warn!(disk = %disk_request.name, error = %e, "Disk allocation failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            let failures = self.delete_all(disks.iter()).await;
            if failures > 0 {
                error!(failures, "Could not roll back every allocated disk");
            }
            return Err(err);
        }

        let mut disks = disks.into_iter();
        let Some(system_disk) = disks.next() else {
            return Err(OrchestratorError::InvalidInput("machine has no system disk".into()));
        };
        Ok(request.with_disks(system_disk, disks.collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DiskFormat;
    use crate::hypervisor::{Fault, MemoryHypervisor};
    use std::sync::Arc;

    fn manager() -> (Arc<MemoryHypervisor>, DiskManager) {
        let hypervisor = Arc::new(MemoryHypervisor::with_default_pools());
        let handle = HypervisorHandle::new(hypervisor.clone());
        (hypervisor, DiskManager::new(handle, 107, 107))
    }

    fn request(name: &str) -> DiskRequest {
        DiskRequest {
            name: name.to_string(),
            size: 1 << 30,
            format: DiskFormat::Qcow2,
            pool: StoragePool::Images,
        }
    }

    #[test]
    fn volume_descriptor_carries_worker_permissions() {
        let (_, manager) = manager();
        let disk = Disk::from_request(Uuid::nil(), &request("root"));

        let xml = manager.volume_xml(&disk);

        assert!(xml.contains("<name>00000000-0000-0000-0000-000000000000.qcow2</name>"));
        assert!(xml.contains("<capacity unit=\"bytes\">1073741824</capacity>"));
        assert!(xml.contains("<owner>107</owner>"));
        assert!(xml.contains("<mode>0660</mode>"));
    }

    #[tokio::test]
    async fn create_activates_pool_and_delete_removes_volume() {
        let (hypervisor, manager) = manager();

        let uuid = manager.create_disk(&request("root")).await.unwrap();
        assert!(hypervisor.volume_exists(uuid));
        assert_eq!(manager.disk_size(uuid, StoragePool::Images).await.unwrap(), 1 << 30);
        assert!(manager.disk_occupancy(uuid, StoragePool::Images).await.unwrap() > 0);

        assert!(manager.delete_disk(uuid, StoragePool::Images).await);
        assert!(!hypervisor.volume_exists(uuid));
        // Deleting again is a logged no-op.
        assert!(!manager.delete_disk(uuid, StoragePool::Images).await);
    }

    #[tokio::test]
    async fn missing_pool_is_reported_as_such() {
        let hypervisor = Arc::new(MemoryHypervisor::new());
        let manager = DiskManager::new(HypervisorHandle::new(hypervisor), 0, 0);

        let err = manager.create_disk(&request("root")).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::PoolNotFound(pool) if pool == "images"));
    }

    #[tokio::test]
    async fn size_of_missing_volume_is_an_error() {
        let (_, manager) = manager();

        assert!(manager.disk_size(Uuid::new_v4(), StoragePool::Images).await.is_err());
    }
}
