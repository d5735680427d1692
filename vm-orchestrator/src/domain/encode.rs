use super::xml::Element;
use super::{
    Disk, Framebuffer, FramebufferPort, InstallMedia, Listen, MachineSpecification,
    NetworkInterface,
};
use uuid::Uuid;

/// Namespace URI of the orchestrator's `<metadata>` block.
pub const METADATA_NAMESPACE: &str = "http://vm-orchestrator.dev/xmlns/machine/1.0";
pub const METADATA_PREFIX: &str = "vmo";

pub(crate) const SYSTEM_BOOT_ORDER: u32 = 1;
pub(crate) const INSTALL_MEDIA_BOOT_ORDER: u32 = 2;
pub(crate) const USER_ALIAS_PREFIX: &str = "ua-";

const GUEST_AGENT_CHANNEL: &str = "org.qemu.guest_agent.0";
const VIDEO_MODEL: &str = "virtio";

/// Builds the libvirt domain document for an allocated specification.
///
/// Pure and deterministic: the same specification and id always produce the
/// same document. The hypervisor validates the result against its schema on
/// definition, so element and attribute names here must match it exactly.
pub fn encode(spec: &MachineSpecification, machine_id: Uuid, domain_type: &str) -> String {
    let mut devices = Element::new("devices")
        .child(disk_element(&spec.system_disk, "vda", Some(SYSTEM_BOOT_ORDER)));

    if let Some(media) = &spec.install_media {
        devices.push(install_media_element(media));
    }

    for (index, disk) in spec.additional_disks.iter().enumerate() {
        devices.push(disk_element(disk, &target_device(index + 2), None));
    }

    for interface in &spec.interfaces {
        devices.push(interface_element(interface));
    }

    devices.push(
        Element::new("channel").attr("type", "unix").child(
            Element::new("target")
                .attr("type", "virtio")
                .attr("name", GUEST_AGENT_CHANNEL),
        ),
    );
    devices.push(
        Element::new("input")
            .attr("type", "tablet")
            .attr("bus", "usb"),
    );
    devices.push(graphics_element(&spec.framebuffer));
    devices.push(
        Element::new("video").child(
            Element::new("model")
                .attr("type", VIDEO_MODEL)
                .attr("heads", 1)
                .attr("primary", "yes"),
        ),
    );

    Element::new("domain")
        .attr("type", domain_type)
        .child(Element::text("name", machine_id))
        .child(Element::text("uuid", machine_id))
        .child(Element::text("title", &spec.title))
        .child(Element::text("description", &spec.description))
        .child(Element::new("metadata").child(metadata_element(spec)))
        .child(Element::text("memory", spec.memory).attr("unit", "MiB"))
        .child(Element::text("currentMemory", spec.memory).attr("unit", "MiB"))
        .child(Element::text("vcpu", spec.vcpus).attr("placement", "static"))
        .child(
            Element::new("os").child(
                Element::text("type", "hvm")
                    .attr("arch", "x86_64")
                    .attr("machine", "q35"),
            ),
        )
        .child(
            Element::new("features")
                .child(Element::new("acpi"))
                .child(Element::new("apic")),
        )
        .child(
            Element::new("cpu")
                .attr("mode", "host-passthrough")
                .attr("check", "none"),
        )
        .child(
            Element::new("clock")
                .attr("offset", "utc")
                .child(
                    Element::new("timer")
                        .attr("name", "rtc")
                        .attr("tickpolicy", "catchup"),
                )
                .child(
                    Element::new("timer")
                        .attr("name", "pit")
                        .attr("tickpolicy", "delay"),
                )
                .child(
                    Element::new("timer")
                        .attr("name", "hpet")
                        .attr("present", "no"),
                ),
        )
        .child(Element::text("on_poweroff", "destroy"))
        .child(Element::text("on_reboot", "restart"))
        .child(Element::text("on_crash", "restart"))
        .child(devices)
        .render()
}

fn metadata_element(spec: &MachineSpecification) -> Element {
    let ns = |name: &str| format!("{}:{}", METADATA_PREFIX, name);

    let tags = Element::new(ns("tags")).children(
        spec.tags
            .iter()
            .map(|tag| Element::text(ns("tag"), tag)),
    );
    let disks = Element::new(ns("disks")).children(spec.disks().map(|disk| {
        Element::new(ns("disk"))
            .attr("uuid", disk.uuid)
            .attr("name", &disk.name)
    }));

    Element::new(ns("machine"))
        .attr(format!("xmlns:{}", METADATA_PREFIX), METADATA_NAMESPACE)
        .child(tags)
        .child(disks)
}

fn disk_element(disk: &Disk, target: &str, boot_order: Option<u32>) -> Element {
    let mut element = Element::new("disk")
        .attr("type", "volume")
        .attr("device", "disk")
        .child(
            Element::new("driver")
                .attr("name", "qemu")
                .attr("type", disk.format),
        )
        .child(
            Element::new("source")
                .attr("pool", disk.pool)
                .attr("volume", disk.volume_name()),
        )
        .child(
            Element::new("target")
                .attr("dev", target)
                .attr("bus", "virtio"),
        );

    if let Some(order) = boot_order {
        element.push(Element::new("boot").attr("order", order));
    }
    element
}

fn install_media_element(media: &InstallMedia) -> Element {
    Element::new("disk")
        .attr("type", "volume")
        .attr("device", "cdrom")
        .child(
            Element::new("driver")
                .attr("name", "qemu")
                .attr("type", "raw"),
        )
        .child(
            Element::new("source")
                .attr("pool", media.pool)
                .attr("volume", &media.volume),
        )
        .child(
            Element::new("target")
                .attr("dev", "sda")
                .attr("bus", "sata"),
        )
        .child(Element::new("readonly"))
        .child(Element::new("boot").attr("order", INSTALL_MEDIA_BOOT_ORDER))
}

fn interface_element(interface: &NetworkInterface) -> Element {
    let alias = format!("{}{}", USER_ALIAS_PREFIX, interface.name);
    let source = &interface.source;
    let mut element = Element::new("interface")
        .attr("type", source.kind())
        .child(Element::new("alias").attr("name", alias))
        .child(Element::new("source").attr(source.attribute(), source.value()));

    if let Some(mac) = &interface.mac {
        element.push(Element::new("mac").attr("address", mac));
    }
    element.child(Element::new("model").attr("type", "virtio"))
}

fn graphics_element(framebuffer: &Framebuffer) -> Element {
    let mut graphics = Element::new("graphics").attr("type", framebuffer.kind.as_str());
    graphics = match framebuffer.port {
        FramebufferPort::Auto => graphics.attr("autoport", "yes"),
        FramebufferPort::Fixed(port) => graphics.attr("port", port).attr("autoport", "no"),
    };

    let listen = match &framebuffer.listen {
        Listen::Network { listen_network } => Element::new("listen")
            .attr("type", "network")
            .attr("network", listen_network),
        Listen::Address { listen_address } => Element::new("listen")
            .attr("type", "address")
            .attr("address", listen_address),
    };
    graphics.child(listen)
}

/// `vd` device name for a zero-based disk index: 0 → `vda`, 25 → `vdz`, 26 → `vdaa`.
pub(crate) fn target_device(index: usize) -> String {
    let mut suffix = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        suffix.push(b'a' + rem as u8);
        n = (n - 1) / 26;
    }
    suffix.reverse();
    format!("vd{}", String::from_utf8_lossy(&suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DiskFormat, FramebufferKind, StoragePool};
    use std::collections::BTreeSet;

    fn single_disk_machine() -> MachineSpecification {
        MachineSpecification {
            title: "root only".to_string(),
            description: String::new(),
            tags: Vec::new(),
            memory: 2048,
            vcpus: 2,
            system_disk: Disk {
                uuid: Uuid::from_u128(7),
                name: "root".to_string(),
                size: 21_474_836_480,
                format: DiskFormat::Qcow2,
                pool: StoragePool::Images,
            },
            additional_disks: Vec::new(),
            install_media: None,
            interfaces: Vec::new(),
            framebuffer: Framebuffer {
                kind: FramebufferKind::Vnc,
                port: FramebufferPort::Auto,
                listen: Listen::Network {
                    listen_network: "vm-net".to_string(),
                },
            },
            assigned_clients: BTreeSet::new(),
        }
    }

    #[test]
    fn system_disk_boots_first_and_auto_port_has_no_port_attribute() {
        let xml = encode(&single_disk_machine(), Uuid::from_u128(1), "kvm");
        let doc = roxmltree::Document::parse(&xml).unwrap();

        let disks: Vec<_> = doc
            .descendants()
            .filter(|n| n.has_tag_name("disk") && n.tag_name().namespace().is_none())
            .collect();
        assert_eq!(disks.len(), 1);
        let disk = disks[0];
        let boot = disk.children().find(|n| n.has_tag_name("boot")).unwrap();
        let driver = disk.children().find(|n| n.has_tag_name("driver")).unwrap();
        assert_eq!(boot.attribute("order"), Some("1"));
        assert_eq!(driver.attribute("type"), Some("qcow2"));

        let graphics = doc
            .descendants()
            .find(|n| n.has_tag_name("graphics"))
            .unwrap();
        assert_eq!(graphics.attribute("autoport"), Some("yes"));
        assert_eq!(graphics.attribute("port"), None);
        let listen = graphics
            .children()
            .find(|n| n.has_tag_name("listen"))
            .unwrap();
        assert_eq!(listen.attribute("network"), Some("vm-net"));
    }

    #[test]
    fn encoding_is_deterministic() {
        let spec = single_disk_machine();
        let id = Uuid::from_u128(1);

        assert_eq!(encode(&spec, id, "kvm"), encode(&spec, id, "kvm"));
    }

    #[test]
    fn metadata_block_is_namespaced() {
        let mut spec = single_disk_machine();
        spec.tags = vec!["b".to_string(), "a".to_string()];

        let xml = encode(&spec, Uuid::from_u128(1), "kvm");

        assert!(xml.contains(&format!("xmlns:{}=\"{}\"", METADATA_PREFIX, METADATA_NAMESPACE)));
        let b = xml.find("<vmo:tag>b</vmo:tag>").unwrap();
        let a = xml.find("<vmo:tag>a</vmo:tag>").unwrap();
        assert!(b < a, "tag order must be preserved");
    }

    #[test]
    fn target_devices_follow_letter_sequence() {
        assert_eq!(target_device(0), "vda");
        assert_eq!(target_device(2), "vdc");
        assert_eq!(target_device(25), "vdz");
        assert_eq!(target_device(26), "vdaa");
    }
}
