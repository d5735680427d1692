//! Machine specification model and the hypervisor domain-description codec.
//!
//! A [`MachineSpec`] is generic over its disk representation: requests carry
//! [`DiskRequest`]s that have no backing volume yet, while a
//! [`MachineSpecification`] carries allocated [`Disk`]s. Encoding only accepts
//! the latter, so volume allocation always happens before a document is built.

mod decode;
mod encode;
pub(crate) mod xml;

pub use decode::{
    decode, live_framebuffer_port, parse, DecodedDomain, ParsedDisk, ParsedDomain, VolumeSizes,
};
pub use encode::{encode, METADATA_NAMESPACE, METADATA_PREFIX};

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// On-disk volume format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    Qcow2,
    Qed,
    Qcow,
    Luks,
    Vdi,
    Vmdk,
    Vpc,
    Vhdx,
}

impl DiskFormat {
    pub const ALL: [DiskFormat; 9] = [
        DiskFormat::Raw,
        DiskFormat::Qcow2,
        DiskFormat::Qed,
        DiskFormat::Qcow,
        DiskFormat::Luks,
        DiskFormat::Vdi,
        DiskFormat::Vmdk,
        DiskFormat::Vpc,
        DiskFormat::Vhdx,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Qed => "qed",
            DiskFormat::Qcow => "qcow",
            DiskFormat::Luks => "luks",
            DiskFormat::Vdi => "vdi",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vpc => "vpc",
            DiskFormat::Vhdx => "vhdx",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskFormat {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        DiskFormat::ALL
            .into_iter()
            .find(|format| format.as_str() == s)
            .ok_or_else(|| OrchestratorError::InvalidInput(format!("unknown disk format: {}", s)))
    }
}

/// Storage pools volumes may live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoragePool {
    Default,
    Images,
    Iso,
}

impl StoragePool {
    pub const ALL: [StoragePool; 3] = [StoragePool::Default, StoragePool::Images, StoragePool::Iso];

    pub fn as_str(self) -> &'static str {
        match self {
            StoragePool::Default => "default",
            StoragePool::Images => "images",
            StoragePool::Iso => "iso",
        }
    }
}

impl fmt::Display for StoragePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoragePool {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        StoragePool::ALL
            .into_iter()
            .find(|pool| pool.as_str() == s)
            .ok_or_else(|| OrchestratorError::InvalidInput(format!("unknown storage pool: {}", s)))
    }
}

/// A disk that still has to be allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRequest {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub format: DiskFormat,
    pub pool: StoragePool,
}

/// A disk backed by an existing volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub uuid: Uuid,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub format: DiskFormat,
    pub pool: StoragePool,
}

impl Disk {
    pub fn from_request(uuid: Uuid, request: &DiskRequest) -> Self {
        Self {
            uuid,
            name: request.name.clone(),
            size: request.size,
            format: request.format,
            pool: request.pool,
        }
    }

    /// Volume name inside the pool.
    pub fn volume_name(&self) -> String {
        format!("{}.{}", self.uuid, self.format)
    }
}

/// ISO (or other read-only image) attached as a CD-ROM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMedia {
    pub pool: StoragePool,
    pub volume: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_type", content = "source", rename_all = "lowercase")]
pub enum InterfaceSource {
    Network(String),
    Bridge(String),
    Direct(String),
}

impl InterfaceSource {
    pub fn kind(&self) -> &'static str {
        match self {
            InterfaceSource::Network(_) => "network",
            InterfaceSource::Bridge(_) => "bridge",
            InterfaceSource::Direct(_) => "direct",
        }
    }

    /// Attribute of `<source>` carrying the value for this interface type.
    pub fn attribute(&self) -> &'static str {
        match self {
            InterfaceSource::Network(_) => "network",
            InterfaceSource::Bridge(_) => "bridge",
            InterfaceSource::Direct(_) => "dev",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            InterfaceSource::Network(v)
            | InterfaceSource::Bridge(v)
            | InterfaceSource::Direct(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(flatten)]
    pub source: InterfaceSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramebufferKind {
    Vnc,
    Spice,
    Rdp,
}

impl FramebufferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FramebufferKind::Vnc => "vnc",
            FramebufferKind::Spice => "spice",
            FramebufferKind::Rdp => "rdp",
        }
    }
}

impl FromStr for FramebufferKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vnc" => Ok(FramebufferKind::Vnc),
            "spice" => Ok(FramebufferKind::Spice),
            "rdp" => Ok(FramebufferKind::Rdp),
            other => Err(OrchestratorError::InvalidInput(format!(
                "unknown framebuffer type: {}",
                other
            ))),
        }
    }
}

/// `"auto"` lets the hypervisor pick a free port when the machine starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PortValue", into = "PortValue")]
pub enum FramebufferPort {
    Auto,
    Fixed(u16),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

impl TryFrom<PortValue> for FramebufferPort {
    type Error = String;

    fn try_from(value: PortValue) -> std::result::Result<Self, Self::Error> {
        match value {
            PortValue::Number(port) => Ok(FramebufferPort::Fixed(port)),
            PortValue::Text(text) if text == "auto" => Ok(FramebufferPort::Auto),
            PortValue::Text(text) => text
                .parse()
                .map(FramebufferPort::Fixed)
                .map_err(|_| format!("invalid framebuffer port: {}", text)),
        }
    }
}

impl From<FramebufferPort> for PortValue {
    fn from(port: FramebufferPort) -> Self {
        match port {
            FramebufferPort::Auto => PortValue::Text("auto".to_string()),
            FramebufferPort::Fixed(port) => PortValue::Number(port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "listen_type", rename_all = "lowercase")]
pub enum Listen {
    Network { listen_network: String },
    Address { listen_address: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framebuffer {
    #[serde(rename = "type")]
    pub kind: FramebufferKind,
    pub port: FramebufferPort,
    #[serde(flatten)]
    pub listen: Listen,
}

/// Everything needed to define a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "D: Deserialize<'de>"))]
pub struct MachineSpec<D> {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub memory: u64,
    pub vcpus: u32,
    pub system_disk: D,
    #[serde(default)]
    pub additional_disks: Vec<D>,
    #[serde(default)]
    pub install_media: Option<InstallMedia>,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
    pub framebuffer: Framebuffer,
    #[serde(default)]
    pub assigned_clients: BTreeSet<String>,
}

pub type MachineRequest = MachineSpec<DiskRequest>;
pub type MachineSpecification = MachineSpec<Disk>;

impl<D> MachineSpec<D> {
    /// System disk first, then additional disks in target order.
    pub fn disks(&self) -> impl Iterator<Item = &D> {
        std::iter::once(&self.system_disk).chain(self.additional_disks.iter())
    }

    /// Swap the disk representation, keeping every other field.
    pub fn with_disks<E>(self, system_disk: E, additional_disks: Vec<E>) -> MachineSpec<E> {
        MachineSpec {
            title: self.title,
            description: self.description,
            tags: self.tags,
            memory: self.memory,
            vcpus: self.vcpus,
            system_disk,
            additional_disks,
            install_media: self.install_media,
            interfaces: self.interfaces,
            framebuffer: self.framebuffer,
            assigned_clients: self.assigned_clients,
        }
    }
}

impl MachineRequest {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("title must not be empty".into()));
        }
        if self.memory == 0 {
            return Err(OrchestratorError::InvalidInput("memory must be positive".into()));
        }
        if self.vcpus == 0 {
            return Err(OrchestratorError::InvalidInput("vcpus must be positive".into()));
        }
        for disk in self.disks() {
            if disk.name.trim().is_empty() {
                return Err(OrchestratorError::InvalidInput("disk name must not be empty".into()));
            }
            if disk.size == 0 {
                return Err(OrchestratorError::InvalidInput(format!(
                    "disk {} must have a positive size",
                    disk.name
                )));
            }
        }
        if self.framebuffer.port == FramebufferPort::Fixed(0) {
            return Err(OrchestratorError::InvalidInput(
                "framebuffer port 0 is not valid, use \"auto\"".into(),
            ));
        }
        // Interface names become device aliases and must be unique.
        let mut names = BTreeSet::new();
        for interface in &self.interfaces {
            if !names.insert(interface.name.as_str()) {
                return Err(OrchestratorError::InvalidInput(format!(
                    "duplicate interface name: {}",
                    interface.name
                )));
            }
        }
        Ok(())
    }
}
