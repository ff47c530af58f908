//! Libvirt `<domain>` documents.

use std::fmt::Write;
use std::path::Path;

use dpusim_core::config::{SimConfig, VmConfig};
use dpusim_core::topology::Topology;

use super::arch::ArchSpec;
use crate::network::xml::escape;

/// NIC model used for host-to-DPU link interfaces.
pub const H2D_NIC_MODEL: &str = "igb";

/// Inputs for one domain definition.
pub struct DomainSpec<'a> {
    pub vm: &'a VmConfig,
    pub arch: &'a ArchSpec,
    pub disk: &'a Path,
    pub seed: &'a Path,
    pub nvram: Option<&'a Path>,
}

/// One `<interface>` per attached network, in config order, then one per
/// host-to-DPU link with this VM at either end.
///
/// Only the `k8s` network pins a MAC; everything else lets libvirt pick.
pub fn interfaces(config: &SimConfig, topology: &Topology, vm: &VmConfig) -> String {
    let mut xml = String::new();

    for net in config.networks.iter().filter(|n| n.attaches_to(vm.vm_type)) {
        let _ = writeln!(xml, "    <interface type='network'>");
        if net.is_k8s()
            && let Some(mac) = &vm.k8s_node_mac
        {
            let _ = writeln!(xml, "      <mac address='{}'/>", escape(mac));
        }
        let _ = writeln!(xml, "      <source network='{}'/>", escape(&net.name));
        if net.use_ovs {
            let _ = writeln!(xml, "      <virtualport type='openvswitch'/>");
        }
        let _ = writeln!(xml, "      <model type='{}'/>", escape(&net.nic_model));
        let _ = writeln!(xml, "    </interface>");
    }

    for link in topology.links_for(&vm.name) {
        let _ = writeln!(xml, "    <interface type='network'>");
        let _ = writeln!(
            xml,
            "      <source network='{}'/>",
            escape(&link.network_name)
        );
        let _ = writeln!(xml, "      <virtualport type='openvswitch'/>");
        let _ = writeln!(xml, "      <model type='{}'/>", H2D_NIC_MODEL);
        let _ = writeln!(xml, "    </interface>");
    }

    xml
}

/// Full domain XML. `interfaces` comes from [`interfaces`].
pub fn domain_xml(spec: &DomainSpec<'_>, interfaces: &str) -> String {
    let DomainSpec {
        vm,
        arch,
        disk,
        seed,
        nvram,
    } = spec;
    let mut xml = String::new();

    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&vm.name));
    let _ = writeln!(xml, "  <memory unit='MiB'>{}</memory>", vm.memory);
    let _ = writeln!(xml, "  <vcpu>{}</vcpu>", vm.vcpus);

    let _ = writeln!(xml, "  <os>");
    let _ = writeln!(
        xml,
        "    <type arch='{}' machine='{}'>hvm</type>",
        arch.libvirt_arch, arch.machine
    );
    if let Some(fw) = &arch.firmware {
        let _ = writeln!(
            xml,
            "    <loader readonly='yes' type='pflash'>{}</loader>",
            escape(&fw.loader.to_string_lossy())
        );
        if let Some(nvram) = nvram {
            let _ = writeln!(xml, "    <nvram>{}</nvram>", escape(&nvram.to_string_lossy()));
        }
    }
    let _ = writeln!(xml, "    <boot dev='hd'/>");
    let _ = writeln!(xml, "  </os>");

    let _ = writeln!(xml, "  <features>");
    if arch.enable_acpi {
        let _ = writeln!(xml, "    <acpi/>");
    }
    if arch.enable_apic {
        let _ = writeln!(xml, "    <apic/>");
        let _ = writeln!(xml, "    <ioapic driver='qemu'/>");
    }
    let _ = writeln!(xml, "  </features>");

    let _ = writeln!(xml, "  <cpu mode='{}'/>", arch.cpu_mode);
    if arch.enable_iommu {
        let _ = writeln!(xml, "  <iommu model='intel'>");
        let _ = writeln!(
            xml,
            "    <driver intremap='on' caching_mode='on' iotlb='on'/>"
        );
        let _ = writeln!(xml, "  </iommu>");
    }

    let _ = writeln!(xml, "  <clock offset='utc'/>");
    let _ = writeln!(xml, "  <on_poweroff>destroy</on_poweroff>");
    let _ = writeln!(xml, "  <on_reboot>restart</on_reboot>");
    let _ = writeln!(xml, "  <on_crash>destroy</on_crash>");

    let _ = writeln!(xml, "  <devices>");
    let _ = writeln!(xml, "    <emulator>{}</emulator>", arch.emulator);
    let _ = write!(
        xml,
        r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
"#,
        disk = escape(&disk.to_string_lossy()),
        seed = escape(&seed.to_string_lossy()),
    );
    xml.push_str(interfaces);
    let _ = write!(
        xml,
        r#"    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <graphics type='vnc' port='-1' autoport='yes'/>
  </devices>
</domain>
"#
    );

    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample as fixture;
    use crate::vm::arch::{UefiFirmware, host_arch_spec};
    use dpusim_core::platform::Arch;
    use std::path::PathBuf;

    #[test]
    fn test_host_interfaces() {
        let (cfg, topo) = fixture();
        let xml = interfaces(&cfg, &topo, cfg.vm("host1").unwrap());
        let sources: Vec<&str> = xml
            .lines()
            .filter_map(|l| l.trim().strip_prefix("<source network='"))
            .map(|l| l.trim_end_matches("'/>"))
            .collect();
        assert_eq!(sources, vec!["mgmt-net", "k8s-net", "h2d-host1-dpu1"]);
        assert_eq!(xml.matches("<mac address=").count(), 1);
        assert!(xml.contains("<mac address='52:54:00:00:01:11'/>"));
        assert!(xml.contains("<model type='igb'/>"));
        assert_eq!(xml.matches("<virtualport type='openvswitch'/>").count(), 2);
    }

    #[test]
    fn test_dpu_interfaces_respect_attach_filter() {
        let (cfg, topo) = fixture();
        let xml = interfaces(&cfg, &topo, cfg.vm("dpu1").unwrap());
        assert!(xml.contains("<source network='mgmt-net'/>"));
        assert!(!xml.contains("k8s-net"));
        assert!(xml.contains("<source network='h2d-host1-dpu1'/>"));
        assert!(!xml.contains("<mac "));
    }

    #[test]
    fn test_x86_domain_xml() {
        let (cfg, _) = fixture();
        let arch = host_arch_spec(Arch::X86_64).unwrap();
        let disk = PathBuf::from("/img/host1.qcow2");
        let seed = PathBuf::from("/img/host1-cloud-init.iso");
        let spec = DomainSpec {
            vm: cfg.vm("host1").unwrap(),
            arch: &arch,
            disk: &disk,
            seed: &seed,
            nvram: None,
        };
        let xml = domain_xml(&spec, "    <interface type='network'/>\n");
        assert!(xml.contains("<name>host1</name>"));
        assert!(xml.contains("<memory unit='MiB'>4096</memory>"));
        assert!(xml.contains("<vcpu>4</vcpu>"));
        assert!(xml.contains("<type arch='x86_64' machine='q35'>hvm</type>"));
        assert!(!xml.contains("<loader"));
        assert!(xml.contains("<ioapic driver='qemu'/>"));
        assert!(xml.contains("<iommu model='intel'>"));
        assert!(xml.contains("<source file='/img/host1.qcow2'/>"));
        assert!(xml.contains("<target dev='sda' bus='sata'/>"));
        assert!(xml.contains("<interface type='network'/>"));
        assert!(xml.ends_with("</domain>\n"));
    }

    #[test]
    fn test_image_paths_are_escaped() {
        let (cfg, _) = fixture();
        let arch = host_arch_spec(Arch::X86_64).unwrap();
        let disk = PathBuf::from("/img/R&D/host1.qcow2");
        let seed = PathBuf::from("/img/it's/host1-cloud-init.iso");
        let spec = DomainSpec {
            vm: cfg.vm("host1").unwrap(),
            arch: &arch,
            disk: &disk,
            seed: &seed,
            nvram: None,
        };
        let xml = domain_xml(&spec, "");
        assert!(xml.contains("<source file='/img/R&amp;D/host1.qcow2'/>"));
        assert!(xml.contains("<source file='/img/it&apos;s/host1-cloud-init.iso'/>"));
    }

    #[test]
    fn test_uefi_domain_xml() {
        let (cfg, _) = fixture();
        let arch = ArchSpec {
            libvirt_arch: "aarch64",
            machine: "virt",
            cpu_mode: "host-passthrough",
            emulator: "/usr/bin/qemu-system-aarch64",
            firmware: Some(UefiFirmware {
                loader: PathBuf::from("/fw/code.fd"),
                vars_template: PathBuf::from("/fw/vars.fd"),
            }),
            enable_iommu: false,
            enable_apic: false,
            enable_acpi: true,
        };
        let disk = PathBuf::from("/img/dpu1.qcow2");
        let seed = PathBuf::from("/img/dpu1-cloud-init.iso");
        let nvram = PathBuf::from("/nv/dpu1_VARS.fd");
        let spec = DomainSpec {
            vm: cfg.vm("dpu1").unwrap(),
            arch: &arch,
            disk: &disk,
            seed: &seed,
            nvram: Some(&nvram),
        };
        let xml = domain_xml(&spec, "");
        assert!(xml.contains("<loader readonly='yes' type='pflash'>/fw/code.fd</loader>"));
        assert!(xml.contains("<nvram>/nv/dpu1_VARS.fd</nvram>"));
        assert!(xml.contains("<acpi/>"));
        assert!(!xml.contains("<apic/>"));
        assert!(!xml.contains("<iommu"));
    }
}
