//! Hypervisor control seam.
//!
//! The control API is synchronous and may block for seconds, so every call
//! from async code goes through [`HypervisorHandle::call`], which runs it on
//! the blocking worker pool.

#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod memory;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtHypervisor;
pub use memory::{Fault, MemoryHypervisor};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Storage pool not found: {0}")]
    PoolNotFound(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(Uuid),

    #[error("Hypervisor rejected the request: {0}")]
    Rejected(String),

    #[error("Worker pool failure: {0}")]
    Worker(String),
}

pub type HypervisorResult<T> = std::result::Result<T, HypervisorError>;

/// Coarse domain state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DomainState::Running
                | DomainState::Blocked
                | DomainState::Paused
                | DomainState::ShuttingDown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub state: DomainState,
    pub vcpus: u32,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub capacity: u64,
    pub allocation: u64,
}

/// Graceful shutdown mechanisms, in the order the reconciler tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    GuestAgent,
    AcpiPowerButton,
    Initctl,
    Signal,
    Paravirt,
    Default,
}

impl ShutdownMode {
    pub const DESCENDING: [ShutdownMode; 6] = [
        ShutdownMode::GuestAgent,
        ShutdownMode::AcpiPowerButton,
        ShutdownMode::Initctl,
        ShutdownMode::Signal,
        ShutdownMode::Paravirt,
        ShutdownMode::Default,
    ];
}

/// Domain and storage operations used by the orchestrator.
///
/// Domains are addressed by UUID, pools and volumes by name.
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &'static str;

    fn pool_is_active(&self, pool: &str) -> HypervisorResult<bool>;
    fn activate_pool(&self, pool: &str) -> HypervisorResult<()>;
    fn create_volume(&self, pool: &str, volume_xml: &str) -> HypervisorResult<()>;
    fn list_volumes(&self, pool: &str) -> HypervisorResult<Vec<String>>;
    fn delete_volume(&self, pool: &str, volume: &str) -> HypervisorResult<()>;
    fn volume_info(&self, pool: &str, volume: &str) -> HypervisorResult<VolumeInfo>;

    /// Defines a persistent domain; `validate` asks the hypervisor to check
    /// the document against its schema first.
    fn define_domain(&self, xml: &str, validate: bool) -> HypervisorResult<Uuid>;
    fn undefine_domain(&self, id: Uuid) -> HypervisorResult<()>;
    fn domain_xml(&self, id: Uuid) -> HypervisorResult<String>;
    fn domain_state(&self, id: Uuid) -> HypervisorResult<DomainState>;
    fn domain_info(&self, id: Uuid) -> HypervisorResult<DomainInfo>;
    fn start_domain(&self, id: Uuid) -> HypervisorResult<()>;
    fn shutdown_domain(&self, id: Uuid, mode: ShutdownMode) -> HypervisorResult<()>;
    fn destroy_domain(&self, id: Uuid) -> HypervisorResult<()>;
}

/// Shared handle that dispatches hypervisor calls to the blocking pool.
#[derive(Clone)]
pub struct HypervisorHandle {
    inner: Arc<dyn Hypervisor>,
}

impl HypervisorHandle {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { inner: hypervisor }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    pub async fn call<T, F>(&self, f: F) -> HypervisorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Hypervisor) -> HypervisorResult<T> + Send + 'static,
    {
        let hypervisor = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(hypervisor.as_ref()))
            .await
            .map_err(|e| HypervisorError::Worker(e.to_string()))?
    }
}

impl std::fmt::Debug for HypervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorHandle")
            .field("backend", &self.inner.name())
            .finish()
    }
}

/// Opens the backend named by `uri`: `memory://` for the in-process backend,
/// anything else is handed to libvirt.
pub fn connect(uri: &str) -> HypervisorResult<Arc<dyn Hypervisor>> {
    if uri.starts_with("memory://") {
        return Ok(Arc::new(MemoryHypervisor::with_default_pools()));
    }

    #[cfg(feature = "libvirt")]
    {
        Ok(Arc::new(LibvirtHypervisor::connect(uri)?))
    }

    #[cfg(not(feature = "libvirt"))]
    {
        Err(HypervisorError::ConnectionFailed(format!(
            "{}: built without the `libvirt` feature",
            uri
        )))
    }
}
