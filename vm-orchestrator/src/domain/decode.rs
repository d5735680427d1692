use super::encode::{
    INSTALL_MEDIA_BOOT_ORDER, METADATA_NAMESPACE, SYSTEM_BOOT_ORDER, USER_ALIAS_PREFIX,
};
use super::{
    Disk, DiskFormat, Framebuffer, FramebufferKind, FramebufferPort, InstallMedia,
    InterfaceSource, Listen, MachineSpecification, NetworkInterface, StoragePool,
};
use crate::error::{OrchestratorError, Result};
use roxmltree::{Document, Node};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Out-of-band size lookup; the domain document does not record volume sizes.
pub trait VolumeSizes {
    fn volume_size(&self, volume: Uuid, pool: StoragePool) -> Result<u64>;
}

impl VolumeSizes for HashMap<Uuid, u64> {
    fn volume_size(&self, volume: Uuid, pool: StoragePool) -> Result<u64> {
        self.get(&volume).copied().ok_or_else(|| {
            OrchestratorError::NotFound(format!("volume {} in pool {}", volume, pool))
        })
    }
}

/// A disk as described by the document, before its size is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDisk {
    pub uuid: Uuid,
    pub name: String,
    pub format: DiskFormat,
    pub pool: StoragePool,
    pub target: String,
    pub boot_order: Option<u32>,
}

impl ParsedDisk {
    fn into_disk(self, sizes: &dyn VolumeSizes) -> Result<Disk> {
        let size = sizes.volume_size(self.uuid, self.pool)?;
        Ok(Disk {
            uuid: self.uuid,
            name: self.name,
            size,
            format: self.format,
            pool: self.pool,
        })
    }
}

/// Everything read from the document itself.
#[derive(Debug, Clone)]
pub struct ParsedDomain {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub memory: u64,
    pub vcpus: u32,
    pub system_disk: ParsedDisk,
    pub additional_disks: Vec<ParsedDisk>,
    pub install_media: Option<InstallMedia>,
    pub interfaces: Vec<NetworkInterface>,
    pub framebuffer: Framebuffer,
    /// Port the hypervisor is currently exposing, if any.
    pub live_port: Option<u16>,
}

impl ParsedDomain {
    pub fn disks(&self) -> impl Iterator<Item = &ParsedDisk> {
        std::iter::once(&self.system_disk).chain(self.additional_disks.iter())
    }

    /// Completes the specification with volume sizes. Assigned clients live in
    /// the relational store and are left empty.
    pub fn into_specification(self, sizes: &dyn VolumeSizes) -> Result<DecodedDomain> {
        let system_disk = self.system_disk.into_disk(sizes)?;
        let additional_disks = self
            .additional_disks
            .into_iter()
            .map(|disk| disk.into_disk(sizes))
            .collect::<Result<Vec<_>>>()?;

        Ok(DecodedDomain {
            id: self.id,
            live_port: self.live_port,
            specification: MachineSpecification {
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
                assigned_clients: BTreeSet::new(),
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct DecodedDomain {
    pub id: Uuid,
    pub specification: MachineSpecification,
    pub live_port: Option<u16>,
}

/// Parses and completes a domain document in one step.
pub fn decode(xml: &str, sizes: &dyn VolumeSizes) -> Result<DecodedDomain> {
    parse(xml)?.into_specification(sizes)
}

/// Port currently assigned to the framebuffer, `None` while the hypervisor
/// has not allocated one (autoport on a stopped machine reports `-1`).
pub fn live_framebuffer_port(xml: &str) -> Result<Option<u16>> {
    let doc = Document::parse(xml)?;
    let devices = required_child(doc.root_element(), "devices", "domain/devices")?;
    let graphics = required_child(devices, "graphics", "domain/devices/graphics")?;
    Ok(port_attribute(graphics))
}

pub fn parse(xml: &str) -> Result<ParsedDomain> {
    let doc = Document::parse(xml)?;
    let domain = doc.root_element();
    if !domain.has_tag_name("domain") {
        return Err(OrchestratorError::MalformedDomainDescription("domain".into()));
    }

    let id = required_text(domain, "uuid", "domain/uuid")?
        .parse::<Uuid>()
        .map_err(|_| malformed("domain/uuid"))?;
    let title = required_text(domain, "title", "domain/title")?.to_string();
    let description = child(domain, "description")
        .and_then(|n| n.text())
        .unwrap_or_default()
        .to_string();

    let metadata = required_child(domain, "metadata", "domain/metadata")?;
    let machine = metadata
        .children()
        .find(|n| n.has_tag_name((METADATA_NAMESPACE, "machine")))
        .ok_or_else(|| malformed("domain/metadata/machine"))?;
    let tags = parse_tags(machine)?;
    let disk_names = parse_disk_names(machine)?;

    let memory_node = required_child(domain, "memory", "domain/memory")?;
    let memory = parse_memory_mib(memory_node)?;
    let vcpus = required_text(domain, "vcpu", "domain/vcpu")?
        .trim()
        .parse::<u32>()
        .map_err(|_| malformed("domain/vcpu"))?;

    let devices = required_child(domain, "devices", "domain/devices")?;

    let mut system_disk = None;
    let mut additional_disks = Vec::new();
    let mut install_media = None;
    for disk in devices.children().filter(|n| n.has_tag_name("disk")) {
        match disk.attribute("device").unwrap_or("disk") {
            "cdrom" => {
                if boot_order(disk)? == Some(INSTALL_MEDIA_BOOT_ORDER) || install_media.is_none() {
                    install_media = parse_install_media(disk)?;
                }
            }
            "disk" => {
                let parsed = parse_disk(disk, &disk_names)?;
                if parsed.boot_order == Some(SYSTEM_BOOT_ORDER) {
                    system_disk = Some(parsed);
                } else {
                    additional_disks.push(parsed);
                }
            }
            _ => {}
        }
    }
    let system_disk = system_disk.ok_or_else(|| malformed("domain/devices/disk[boot/@order=1]"))?;
    additional_disks.sort_by(|a, b| (a.target.len(), &a.target).cmp(&(b.target.len(), &b.target)));

    let interfaces = devices
        .children()
        .filter(|n| n.has_tag_name("interface"))
        .map(parse_interface)
        .collect::<Result<Vec<_>>>()?;

    let graphics = required_child(devices, "graphics", "domain/devices/graphics")?;
    let framebuffer = parse_framebuffer(graphics)?;
    let live_port = port_attribute(graphics);

    Ok(ParsedDomain {
        id,
        title,
        description,
        tags,
        memory,
        vcpus,
        system_disk,
        additional_disks,
        install_media,
        interfaces,
        framebuffer,
        live_port,
    })
}

fn malformed(path: &str) -> OrchestratorError {
    OrchestratorError::MalformedDomainDescription(path.to_string())
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| {
        n.is_element() && n.tag_name().name() == name && n.tag_name().namespace().is_none()
    })
}

fn required_child<'a, 'input>(
    node: Node<'a, 'input>,
    name: &str,
    path: &str,
) -> Result<Node<'a, 'input>> {
    child(node, name).ok_or_else(|| malformed(path))
}

fn required_text<'a>(node: Node<'a, '_>, name: &str, path: &str) -> Result<&'a str> {
    required_child(node, name, path)?
        .text()
        .ok_or_else(|| malformed(path))
}

fn required_attribute<'a>(node: Node<'a, '_>, name: &str, path: &str) -> Result<&'a str> {
    node.attribute(name).ok_or_else(|| malformed(path))
}

fn ns_children<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |n| n.has_tag_name((METADATA_NAMESPACE, name)))
}

fn parse_tags(machine: Node) -> Result<Vec<String>> {
    let Some(tags) = ns_children(machine, "tags").next() else {
        return Ok(Vec::new());
    };
    Ok(ns_children(tags, "tag")
        .map(|tag| tag.text().unwrap_or_default().to_string())
        .collect())
}

fn parse_disk_names(machine: Node) -> Result<HashMap<Uuid, String>> {
    let mut names = HashMap::new();
    if let Some(disks) = ns_children(machine, "disks").next() {
        for disk in ns_children(disks, "disk") {
            const UUID_PATH: &str = "domain/metadata/machine/disks/disk/@uuid";
            const NAME_PATH: &str = "domain/metadata/machine/disks/disk/@name";
            let uuid = required_attribute(disk, "uuid", UUID_PATH)?
                .parse::<Uuid>()
                .map_err(|_| malformed(UUID_PATH))?;
            let name = required_attribute(disk, "name", NAME_PATH)?;
            names.insert(uuid, name.to_string());
        }
    }
    Ok(names)
}

fn parse_memory_mib(node: Node) -> Result<u64> {
    let value = node
        .text()
        .and_then(|t| t.trim().parse::<u64>().ok())
        .ok_or_else(|| malformed("domain/memory"))?;
    let bytes_per_unit: u64 = match node.attribute("unit").unwrap_or("KiB") {
        "b" | "bytes" => 1,
        "KB" => 1_000,
        "k" | "KiB" => 1 << 10,
        "MB" => 1_000_000,
        "M" | "MiB" => 1 << 20,
        "GB" => 1_000_000_000,
        "G" | "GiB" => 1 << 30,
        "T" | "TiB" => 1 << 40,
        _ => return Err(malformed("domain/memory/@unit")),
    };
    Ok(value.saturating_mul(bytes_per_unit) / (1 << 20))
}

fn boot_order(disk: Node) -> Result<Option<u32>> {
    match child(disk, "boot") {
        None => Ok(None),
        Some(boot) => required_attribute(boot, "order", "domain/devices/disk/boot/@order")?
            .parse()
            .map(Some)
            .map_err(|_| malformed("domain/devices/disk/boot/@order")),
    }
}

fn parse_disk(disk: Node, names: &HashMap<Uuid, String>) -> Result<ParsedDisk> {
    let driver = required_child(disk, "driver", "domain/devices/disk/driver")?;
    let format = required_attribute(driver, "type", "domain/devices/disk/driver/@type")?
        .parse::<DiskFormat>()
        .map_err(|_| malformed("domain/devices/disk/driver/@type"))?;

    let source = required_child(disk, "source", "domain/devices/disk/source")?;
    let pool = required_attribute(source, "pool", "domain/devices/disk/source/@pool")?
        .parse::<StoragePool>()
        .map_err(|_| malformed("domain/devices/disk/source/@pool"))?;
    let volume = required_attribute(source, "volume", "domain/devices/disk/source/@volume")?;
    let uuid = volume
        .split('.')
        .next()
        .and_then(|prefix| prefix.parse::<Uuid>().ok())
        .ok_or_else(|| malformed("domain/devices/disk/source/@volume"))?;

    let target = required_child(disk, "target", "domain/devices/disk/target")?;
    let target = required_attribute(target, "dev", "domain/devices/disk/target/@dev")?.to_string();

    Ok(ParsedDisk {
        uuid,
        name: names
            .get(&uuid)
            .cloned()
            .unwrap_or_else(|| uuid.to_string()),
        format,
        pool,
        target,
        boot_order: boot_order(disk)?,
    })
}

fn parse_install_media(disk: Node) -> Result<Option<InstallMedia>> {
    // An empty tray has no source.
    let Some(source) = child(disk, "source") else {
        return Ok(None);
    };
    const POOL_PATH: &str = "domain/devices/disk[@device=cdrom]/source/@pool";
    const VOLUME_PATH: &str = "domain/devices/disk[@device=cdrom]/source/@volume";
    let pool = required_attribute(source, "pool", POOL_PATH)?
        .parse::<StoragePool>()
        .map_err(|_| malformed(POOL_PATH))?;
    let volume = required_attribute(source, "volume", VOLUME_PATH)?;
    Ok(Some(InstallMedia {
        pool,
        volume: volume.to_string(),
    }))
}

fn parse_interface(interface: Node) -> Result<NetworkInterface> {
    let kind = required_attribute(interface, "type", "domain/devices/interface/@type")?;
    let source = required_child(interface, "source", "domain/devices/interface/source")?;
    let source_value = |attribute: &str, path: &str| {
        required_attribute(source, attribute, path).map(str::to_string)
    };
    let source = match kind {
        "network" => InterfaceSource::Network(source_value(
            "network",
            "domain/devices/interface/source/@network",
        )?),
        "bridge" => InterfaceSource::Bridge(source_value(
            "bridge",
            "domain/devices/interface/source/@bridge",
        )?),
        "direct" => InterfaceSource::Direct(source_value(
            "dev",
            "domain/devices/interface/source/@dev",
        )?),
        _ => return Err(malformed("domain/devices/interface/@type")),
    };

    let alias = required_child(interface, "alias", "domain/devices/interface/alias")?;
    let alias = required_attribute(alias, "name", "domain/devices/interface/alias/@name")?;
    let name = alias
        .strip_prefix(USER_ALIAS_PREFIX)
        .unwrap_or(alias)
        .to_string();

    let mac = child(interface, "mac")
        .and_then(|mac| mac.attribute("address"))
        .map(str::to_string);

    Ok(NetworkInterface { name, source, mac })
}

fn parse_framebuffer(graphics: Node) -> Result<Framebuffer> {
    let kind = required_attribute(graphics, "type", "domain/devices/graphics/@type")?
        .parse::<FramebufferKind>()
        .map_err(|_| malformed("domain/devices/graphics/@type"))?;

    let port = if graphics.attribute("autoport") == Some("yes") {
        FramebufferPort::Auto
    } else {
        port_attribute(graphics)
            .map(FramebufferPort::Fixed)
            .ok_or_else(|| malformed("domain/devices/graphics/@port"))?
    };

    let listen = required_child(graphics, "listen", "domain/devices/graphics/listen")?;
    let listen = match required_attribute(listen, "type", "domain/devices/graphics/listen/@type")? {
        "network" => Listen::Network {
            listen_network: required_attribute(
                listen,
                "network",
                "domain/devices/graphics/listen/@network",
            )?
            .to_string(),
        },
        "address" => Listen::Address {
            listen_address: required_attribute(
                listen,
                "address",
                "domain/devices/graphics/listen/@address",
            )?
            .to_string(),
        },
        _ => return Err(malformed("domain/devices/graphics/listen/@type")),
    };

    Ok(Framebuffer { kind, port, listen })
}

fn port_attribute(graphics: Node) -> Option<u16> {
    graphics
        .attribute("port")
        .and_then(|p| p.parse::<i32>().ok())
        .filter(|p| *p > 0)
        .and_then(|p| u16::try_from(p).ok())
}
