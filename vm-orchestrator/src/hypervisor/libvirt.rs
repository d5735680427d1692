//! libvirt backend built on the `virt` bindings.

use super::{
    DomainInfo, DomainState, Hypervisor, HypervisorError, HypervisorResult, ShutdownMode,
    VolumeInfo,
};
use tracing::{debug, info};
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

/// One libvirt connection, used concurrently by every blocking worker.
pub struct LibvirtHypervisor {
    uri: String,
    connection: Connect,
}

fn rejected(e: virt::error::Error) -> HypervisorError {
    HypervisorError::Rejected(e.to_string())
}

impl LibvirtHypervisor {
    pub fn connect(uri: &str) -> HypervisorResult<Self> {
        info!(uri = %uri, "Connecting to libvirt");
        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(format!("{}: {}", uri, e)))?;
        Ok(Self {
            uri: uri.to_string(),
            connection,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn pool(conn: &Connect, name: &str) -> HypervisorResult<StoragePool> {
        StoragePool::lookup_by_name(conn, name)
            .map_err(|_| HypervisorError::PoolNotFound(name.to_string()))
    }

    fn volume(conn: &Connect, pool: &str, name: &str) -> HypervisorResult<StorageVol> {
        let pool = Self::pool(conn, pool)?;
        StorageVol::lookup_by_name(&pool, name)
            .map_err(|_| HypervisorError::VolumeNotFound(name.to_string()))
    }

    fn domain(conn: &Connect, id: Uuid) -> HypervisorResult<Domain> {
        Domain::lookup_by_uuid_string(conn, &id.to_string())
            .map_err(|_| HypervisorError::DomainNotFound(id))
    }

    fn state_from_libvirt(state: sys::virDomainState) -> DomainState {
        match state {
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
            sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::ShuttingDown,
            sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => DomainState::Suspended,
            _ => DomainState::Unknown,
        }
    }

    fn shutdown_flag(mode: ShutdownMode) -> u32 {
        match mode {
            ShutdownMode::GuestAgent => sys::VIR_DOMAIN_SHUTDOWN_GUEST_AGENT,
            ShutdownMode::AcpiPowerButton => sys::VIR_DOMAIN_SHUTDOWN_ACPI_POWER_BTN,
            ShutdownMode::Initctl => sys::VIR_DOMAIN_SHUTDOWN_INITCTL,
            ShutdownMode::Signal => sys::VIR_DOMAIN_SHUTDOWN_SIGNAL,
            ShutdownMode::Paravirt => sys::VIR_DOMAIN_SHUTDOWN_PARAVIRT,
            ShutdownMode::Default => sys::VIR_DOMAIN_SHUTDOWN_DEFAULT,
        }
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn name(&self) -> &'static str {
        "libvirt"
    }

    fn pool_is_active(&self, pool: &str) -> HypervisorResult<bool> {
        Self::pool(&self.connection, pool)?
            .is_active()
            .map_err(rejected)
    }

    fn activate_pool(&self, pool: &str) -> HypervisorResult<()> {
        info!(pool = %pool, "Activating storage pool");
        Self::pool(&self.connection, pool)?
            .create(0)
            .map(|_| ())
            .map_err(rejected)
    }

    fn create_volume(&self, pool: &str, volume_xml: &str) -> HypervisorResult<()> {
        let pool = Self::pool(&self.connection, pool)?;
        StorageVol::create_xml(&pool, volume_xml, 0)
            .map(|_| ())
            .map_err(rejected)
    }

    fn list_volumes(&self, pool: &str) -> HypervisorResult<Vec<String>> {
        Self::pool(&self.connection, pool)?
            .list_volumes()
            .map_err(rejected)
    }

    fn delete_volume(&self, pool: &str, volume: &str) -> HypervisorResult<()> {
        Self::volume(&self.connection, pool, volume)?
            .delete(0)
            .map_err(rejected)
    }

    fn volume_info(&self, pool: &str, volume: &str) -> HypervisorResult<VolumeInfo> {
        let info = Self::volume(&self.connection, pool, volume)?
            .get_info()
            .map_err(rejected)?;
        Ok(VolumeInfo {
            capacity: info.capacity,
            allocation: info.allocation,
        })
    }

    fn define_domain(&self, xml: &str, validate: bool) -> HypervisorResult<Uuid> {
        let flags = if validate { sys::VIR_DOMAIN_DEFINE_VALIDATE } else { 0 };
        let domain = Domain::define_xml_flags(&self.connection, xml, flags).map_err(rejected)?;
        let id = domain.get_uuid_string().map_err(rejected)?;
        debug!(domain = %id, "Defined domain");
        id.parse().map_err(|_| HypervisorError::Rejected(format!("invalid domain uuid {}", id)))
    }

    fn undefine_domain(&self, id: Uuid) -> HypervisorResult<()> {
        Self::domain(&self.connection, id)?
            .undefine()
            .map_err(rejected)
    }

    fn domain_xml(&self, id: Uuid) -> HypervisorResult<String> {
        Self::domain(&self.connection, id)?
            .get_xml_desc(0)
            .map_err(rejected)
    }

    fn domain_state(&self, id: Uuid) -> HypervisorResult<DomainState> {
        let (state, _reason) = Self::domain(&self.connection, id)?
            .get_state()
            .map_err(rejected)?;
        Ok(Self::state_from_libvirt(state))
    }

    fn domain_info(&self, id: Uuid) -> HypervisorResult<DomainInfo> {
        let info = Self::domain(&self.connection, id)?
            .get_info()
            .map_err(rejected)?;
        Ok(DomainInfo {
            state: Self::state_from_libvirt(info.state),
            vcpus: info.nr_virt_cpu,
            max_memory_kib: info.max_mem,
            memory_kib: info.memory,
        })
    }

    fn start_domain(&self, id: Uuid) -> HypervisorResult<()> {
        Self::domain(&self.connection, id)?
            .create()
            .map(|_| ())
            .map_err(rejected)
    }

    fn shutdown_domain(&self, id: Uuid, mode: ShutdownMode) -> HypervisorResult<()> {
        Self::domain(&self.connection, id)?
            .shutdown_flags(Self::shutdown_flag(mode))
            .map(|_| ())
            .map_err(rejected)
    }

    fn destroy_domain(&self, id: Uuid) -> HypervisorResult<()> {
        Self::domain(&self.connection, id)?
            .destroy()
            .map_err(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_shareable<T: Send + Sync>() {}

    #[test]
    fn connection_is_used_without_a_lock() {
        assert_shareable::<Connect>();
        assert_shareable::<LibvirtHypervisor>();
    }
}
