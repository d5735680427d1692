//! In-process hypervisor used by tests and `memory://` development deployments.
//!
//! Keeps pools, volumes and domains in memory, behaves like libvirt for the
//! calls the orchestrator makes (autoport rewriting on start, shutoff on
//! shutdown) and accepts [`Fault`]s to simulate backend failures.

use super::{
    DomainInfo, DomainState, Hypervisor, HypervisorError, HypervisorResult, ShutdownMode,
    VolumeInfo,
};
use crate::domain::{self, StoragePool};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

const FIRST_AUTOPORT: u16 = 5900;

/// Failure to inject into the next matching call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fault {
    /// The n-th volume creation (1-based, counted from injection) fails.
    CreateVolume { nth: usize },
    /// The n-th domain definition (1-based, counted from injection) fails.
    DefineDomain { nth: usize },
    /// Reading this domain's description fails.
    ReadDomainXml(Uuid),
    /// Undefining this domain fails.
    UndefineDomain(Uuid),
    /// Starting this domain is rejected.
    StartDomain(Uuid),
    /// Start is accepted but the domain never leaves the paused state.
    HangOnStart(Uuid),
    /// Start is accepted but the domain crashes immediately.
    CrashOnStart(Uuid),
    /// Shutdown requests using this mode are accepted but ignored.
    IgnoreShutdown(ShutdownMode),
    /// Deleting volumes from this pool fails.
    DeleteVolume(String),
}

#[derive(Debug, Default)]
struct Pool {
    active: bool,
    volumes: BTreeMap<String, VolumeInfo>,
}

#[derive(Debug)]
struct Domain {
    xml: String,
    live_xml: Option<String>,
    state: DomainState,
    vcpus: u32,
    memory_mib: u64,
}

#[derive(Debug, Default)]
struct Inner {
    pools: HashMap<String, Pool>,
    domains: HashMap<Uuid, Domain>,
    faults: HashSet<Fault>,
    volume_creations: usize,
    definitions: usize,
    start_calls: HashMap<Uuid, usize>,
    shutdown_calls: Vec<(Uuid, ShutdownMode)>,
    destroy_calls: HashMap<Uuid, usize>,
    next_port: u16,
}

#[derive(Debug, Default)]
pub struct MemoryHypervisor {
    inner: Mutex<Inner>,
}

impl MemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every [`StoragePool`] exists, inactive until first use.
    pub fn with_default_pools() -> Self {
        let hypervisor = Self::new();
        for pool in StoragePool::ALL {
            hypervisor.add_pool(pool.as_str(), false);
        }
        hypervisor
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_pool(&self, name: &str, active: bool) {
        self.lock().pools.insert(
            name.to_string(),
            Pool {
                active,
                volumes: BTreeMap::new(),
            },
        );
    }

    pub fn inject(&self, fault: Fault) {
        let mut inner = self.lock();
        match fault {
            Fault::CreateVolume { .. } => inner.volume_creations = 0,
            Fault::DefineDomain { .. } => inner.definitions = 0,
            _ => {}
        }
        inner.faults.insert(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn volumes(&self, pool: &str) -> Vec<String> {
        self.lock()
            .pools
            .get(pool)
            .map(|p| p.volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any volume named after `uuid` exists in any pool.
    pub fn volume_exists(&self, uuid: Uuid) -> bool {
        let prefix = uuid.to_string();
        self.lock()
            .pools
            .values()
            .any(|pool| pool.volumes.keys().any(|name| name.starts_with(&prefix)))
    }

    pub fn volume_count(&self) -> usize {
        self.lock()
            .pools
            .values()
            .map(|pool| pool.volumes.len())
            .sum()
    }

    pub fn domain_exists(&self, id: Uuid) -> bool {
        self.lock().domains.contains_key(&id)
    }

    pub fn domain_count(&self) -> usize {
        self.lock().domains.len()
    }

    pub fn start_calls(&self, id: Uuid) -> usize {
        self.lock().start_calls.get(&id).copied().unwrap_or(0)
    }

    pub fn destroy_calls(&self, id: Uuid) -> usize {
        self.lock().destroy_calls.get(&id).copied().unwrap_or(0)
    }

    pub fn shutdown_modes(&self, id: Uuid) -> Vec<ShutdownMode> {
        self.lock()
            .shutdown_calls
            .iter()
            .filter(|(domain, _)| *domain == id)
            .map(|(_, mode)| *mode)
            .collect()
    }

    /// Forces a domain into `state`, as if the guest changed on its own.
    pub fn set_state(&self, id: Uuid, state: DomainState) {
        if let Some(domain) = self.lock().domains.get_mut(&id) {
            domain.state = state;
        }
    }

    fn pool_mut<'a>(inner: &'a mut Inner, pool: &str) -> HypervisorResult<&'a mut Pool> {
        inner
            .pools
            .get_mut(pool)
            .ok_or_else(|| HypervisorError::PoolNotFound(pool.to_string()))
    }

    fn domain_mut(inner: &mut Inner, id: Uuid) -> HypervisorResult<&mut Domain> {
        inner.domains.get_mut(&id).ok_or(HypervisorError::DomainNotFound(id))
    }
}

fn parse_volume(xml: &str) -> HypervisorResult<(String, u64)> {
    let doc =
        roxmltree::Document::parse(xml).map_err(|e| HypervisorError::Rejected(e.to_string()))?;
    let root = doc.root_element();
    let text_of = |name: &str| {
        root.children()
            .find(|n| n.has_tag_name(name))
            .and_then(|n| n.text())
            .map(str::trim)
            .ok_or_else(|| {
                HypervisorError::Rejected(format!("volume description lacks <{}>", name))
            })
    };
    let name = text_of("name")?.to_string();
    let capacity = text_of("capacity")?
        .parse::<u64>()
        .map_err(|_| HypervisorError::Rejected("volume capacity is not a number".to_string()))?;
    Ok((name, capacity))
}

impl Hypervisor for MemoryHypervisor {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn pool_is_active(&self, pool: &str) -> HypervisorResult<bool> {
        let mut inner = self.lock();
        Ok(Self::pool_mut(&mut inner, pool)?.active)
    }

    fn activate_pool(&self, pool: &str) -> HypervisorResult<()> {
        let mut inner = self.lock();
        Self::pool_mut(&mut inner, pool)?.active = true;
        Ok(())
    }

    fn create_volume(&self, pool: &str, volume_xml: &str) -> HypervisorResult<()> {
        let (name, capacity) = parse_volume(volume_xml)?;
        let mut inner = self.lock();

        inner.volume_creations += 1;
        let nth = inner.volume_creations;
        if inner.faults.contains(&Fault::CreateVolume { nth }) {
            return Err(HypervisorError::Rejected(format!("volume creation {} failed", nth)));
        }

        let pool = Self::pool_mut(&mut inner, pool)?;
        if !pool.active {
            return Err(HypervisorError::Rejected("storage pool is not active".to_string()));
        }
        if pool.volumes.contains_key(&name) {
            return Err(HypervisorError::Rejected(format!("volume {} already exists", name)));
        }
        pool.volumes.insert(
            name,
            VolumeInfo {
                capacity,
                allocation: capacity / 10,
            },
        );
        Ok(())
    }

    fn list_volumes(&self, pool: &str) -> HypervisorResult<Vec<String>> {
        let mut inner = self.lock();
        Ok(Self::pool_mut(&mut inner, pool)?
            .volumes
            .keys()
            .cloned()
            .collect())
    }

    fn delete_volume(&self, pool: &str, volume: &str) -> HypervisorResult<()> {
        let mut inner = self.lock();
        if inner.faults.contains(&Fault::DeleteVolume(pool.to_string())) {
            return Err(HypervisorError::Rejected(format!("cannot delete from {}", pool)));
        }
        Self::pool_mut(&mut inner, pool)?
            .volumes
            .remove(volume)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::VolumeNotFound(volume.to_string()))
    }

    fn volume_info(&self, pool: &str, volume: &str) -> HypervisorResult<VolumeInfo> {
        let mut inner = self.lock();
        Self::pool_mut(&mut inner, pool)?
            .volumes
            .get(volume)
            .copied()
            .ok_or_else(|| HypervisorError::VolumeNotFound(volume.to_string()))
    }

    fn define_domain(&self, xml: &str, validate: bool) -> HypervisorResult<Uuid> {
        let parsed = domain::parse(xml);
        let mut inner = self.lock();

        inner.definitions += 1;
        let nth = inner.definitions;
        if inner.faults.contains(&Fault::DefineDomain { nth }) {
            return Err(HypervisorError::Rejected(format!("definition {} failed", nth)));
        }

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) if validate => return Err(HypervisorError::Rejected(e.to_string())),
            Err(e) => return Err(HypervisorError::Rejected(format!("unparseable domain: {}", e))),
        };

        let domain = Domain {
            xml: xml.to_string(),
            live_xml: None,
            state: DomainState::Shutoff,
            vcpus: parsed.vcpus,
            memory_mib: parsed.memory,
        };
        match inner.domains.get_mut(&parsed.id) {
            Some(existing) => {
                existing.xml = domain.xml;
                existing.vcpus = domain.vcpus;
                existing.memory_mib = domain.memory_mib;
            }
            None => {
                inner.domains.insert(parsed.id, domain);
            }
        }
        Ok(parsed.id)
    }

    fn undefine_domain(&self, id: Uuid) -> HypervisorResult<()> {
        let mut inner = self.lock();
        if inner.faults.contains(&Fault::UndefineDomain(id)) {
            return Err(HypervisorError::Rejected(format!("cannot undefine {}", id)));
        }
        inner
            .domains
            .remove(&id)
            .map(|_| ())
            .ok_or(HypervisorError::DomainNotFound(id))
    }

    fn domain_xml(&self, id: Uuid) -> HypervisorResult<String> {
        let mut inner = self.lock();
        if inner.faults.contains(&Fault::ReadDomainXml(id)) {
            return Err(HypervisorError::Rejected(format!("cannot read description of {}", id)));
        }
        let domain = Self::domain_mut(&mut inner, id)?;
        Ok(domain.live_xml.clone().unwrap_or_else(|| domain.xml.clone()))
    }

    fn domain_state(&self, id: Uuid) -> HypervisorResult<DomainState> {
        let mut inner = self.lock();
        Ok(Self::domain_mut(&mut inner, id)?.state)
    }

    fn domain_info(&self, id: Uuid) -> HypervisorResult<DomainInfo> {
        let mut inner = self.lock();
        let domain = Self::domain_mut(&mut inner, id)?;
        let max_memory_kib = domain.memory_mib * 1024;
        Ok(DomainInfo {
            state: domain.state,
            vcpus: domain.vcpus,
            max_memory_kib,
            memory_kib: if domain.state.is_active() { max_memory_kib / 2 } else { 0 },
        })
    }

    fn start_domain(&self, id: Uuid) -> HypervisorResult<()> {
        let mut inner = self.lock();
        *inner.start_calls.entry(id).or_default() += 1;

        if inner.faults.contains(&Fault::StartDomain(id)) {
            return Err(HypervisorError::Rejected(format!("cannot start {}", id)));
        }
        let hang = inner.faults.contains(&Fault::HangOnStart(id));
        let crash = inner.faults.contains(&Fault::CrashOnStart(id));

        let port = FIRST_AUTOPORT + inner.next_port;
        let domain = Self::domain_mut(&mut inner, id)?;
        if domain.state.is_active() {
            return Err(HypervisorError::Rejected("domain is already running".to_string()));
        }

        domain.state = match (hang, crash) {
            (true, _) => DomainState::Paused,
            (_, true) => DomainState::Crashed,
            _ => DomainState::Running,
        };
        let assigns_port = domain.xml.contains("autoport=\"yes\"");
        if assigns_port {
            domain.live_xml = Some(
                domain
                    .xml
                    .replace("autoport=\"yes\"", &format!("port=\"{}\" autoport=\"yes\"", port)),
            );
            inner.next_port += 1;
        }
        Ok(())
    }

    fn shutdown_domain(&self, id: Uuid, mode: ShutdownMode) -> HypervisorResult<()> {
        let mut inner = self.lock();
        inner.shutdown_calls.push((id, mode));
        let ignored = inner.faults.contains(&Fault::IgnoreShutdown(mode));

        let domain = Self::domain_mut(&mut inner, id)?;
        if !domain.state.is_active() {
            return Err(HypervisorError::Rejected("domain is not running".to_string()));
        }
        if !ignored {
            domain.state = DomainState::Shutoff;
            domain.live_xml = None;
        }
        Ok(())
    }

    fn destroy_domain(&self, id: Uuid) -> HypervisorResult<()> {
        let mut inner = self.lock();
        *inner.destroy_calls.entry(id).or_default() += 1;

        let domain = Self::domain_mut(&mut inner, id)?;
        if !domain.state.is_active() {
            return Err(HypervisorError::Rejected("domain is not running".to_string()));
        }
        domain.state = DomainState::Shutoff;
        domain.live_xml = None;
        Ok(())
    }
}
