use std::path::Path;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::config::Config;
use crate::error::VmError;
use crate::registry::VmProject;
use crate::usb::{BusAddress, Hostdev, UsbId};

/// Host directory exported to the guest over virtiofs.
pub struct Share<'a> {
    pub dir: &'a Path,
    pub tag: &'a str,
}

/// Generate libvirt domain XML for a project.
///
/// Serial port 0 is the interactive login line (pty, transcript logged to
/// `serial_log_path`). Serial port 1 is file-backed so kernel output lands in
/// `log_path` even when the interactive line is wedged.
pub fn generate_domain_xml(config: &Config, project: &VmProject, share: Option<&Share>) -> String {
    let name = escape(&project.name);
    let memory_kib = config.resources.memory_mb * 1024;
    let cpus = config.resources.cpus;
    let domain_type = escape(&config.advanced.domain_type);
    let machine = escape(&config.advanced.machine);
    let disk = escape_path(&project.disk_path);
    let seed = escape_path(&project.seed_path);
    let kernel_log = escape_path(&project.log_path);
    let serial_log = escape_path(&project.serial_log_path);

    // virtiofs needs shared guest memory
    let (memory_backing, filesystem) = match share {
        Some(share) => (
            "  <memoryBacking>\n    <source type='memfd'/>\n    <access mode='shared'/>\n  </memoryBacking>\n"
                .to_string(),
            format!(
                "    <filesystem type='mount' accessmode='passthrough'>\n      \
                 <driver type='virtiofs'/>\n      \
                 <source dir='{}'/>\n      \
                 <target dir='{}'/>\n    \
                 </filesystem>\n",
                escape_path(share.dir),
                escape(share.tag)
            ),
        ),
        None => (String::new(), String::new()),
    };

    format!(
        r#"<domain type='{domain_type}'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
{memory_backing}  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <devices>
    <disk type='file' device='disk'>
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
{filesystem}    <interface type='network'>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <controller type='usb' model='qemu-xhci'/>
    <serial type='pty'>
      <log file='{serial_log}' append='on'/>
      <target port='0'/>
    </serial>
    <serial type='file'>
      <source path='{kernel_log}' append='on'/>
      <target port='1'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
    )
}

fn escape_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    escape(&*raw).into_owned()
}

/// Passthrough descriptor for a USB host device, keyed by vendor/product id.
///
/// The bus address is only included when it is needed to tell apart two
/// devices with the same id.
pub fn usb_hostdev_xml(id: UsbId, address: Option<BusAddress>) -> String {
    let address = match address {
        Some(a) => format!("\n    <address bus='{}' device='{}'/>", a.bus, a.device),
        None => String::new(),
    };
    format!(
        "<hostdev mode='subsystem' type='usb' managed='yes'>\n  <source>\n    \
         <vendor id='0x{:04x}'/>\n    <product id='0x{:04x}'/>{address}\n  </source>\n</hostdev>\n",
        id.vendor, id.product
    )
}

/// Extract USB hostdev entries from a (live) domain XML description.
pub fn parse_usb_hostdevs(xml: &str) -> Result<Vec<Hostdev>, VmError> {
    let mut reader = Reader::from_str(xml);
    let mut found = Vec::new();

    let mut in_usb_hostdev = false;
    let mut in_source = false;
    let mut vendor = None;
    let mut product = None;
    let mut address = None;

    loop {
        let event = reader.read_event().map_err(|e| VmError::Validation {
            message: format!("malformed domain XML at byte {}: {e}", reader.buffer_position()),
        })?;
        match event {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"hostdev" => {
                    in_usb_hostdev = attr(&e, "type")?.as_deref() == Some("usb");
                    vendor = None;
                    product = None;
                    address = None;
                }
                b"source" if in_usb_hostdev => in_source = true,
                b"vendor" if in_source => vendor = attr(&e, "id")?.and_then(|v| parse_hex_id(&v)),
                b"product" if in_source => product = attr(&e, "id")?.and_then(|v| parse_hex_id(&v)),
                b"address" if in_source => {
                    let bus = attr(&e, "bus")?.and_then(|v| parse_number(&v));
                    let device = attr(&e, "device")?.and_then(|v| parse_number(&v));
                    if let (Some(bus), Some(device)) = (bus, device) {
                        address = Some(BusAddress { bus, device });
                    }
                }
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"source" => in_source = false,
                b"hostdev" => {
                    if in_usb_hostdev
                        && let (Some(vendor), Some(product)) = (vendor, product)
                    {
                        found.push(Hostdev {
                            id: UsbId { vendor, product },
                            address,
                        });
                    }
                    in_usb_hostdev = false;
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(found)
}

fn attr(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, VmError> {
    let attribute = element
        .try_get_attribute(name)
        .map_err(|e| VmError::Validation {
            message: format!("malformed attribute in domain XML: {e}"),
        })?;
    match attribute {
        Some(a) => {
            let value = a.unescape_value().map_err(|e| VmError::Validation {
                message: format!("malformed attribute value in domain XML: {e}"),
            })?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

fn parse_hex_id(s: &str) -> Option<u16> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(digits, 16).ok()
}

/// libvirt accepts both decimal and `0x`-prefixed hex bus/device numbers.
fn parse_number(s: &str) -> Option<u16> {
    match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn project() -> VmProject {
        VmProject::new("test-vm", Path::new("/srv/vms"))
    }

    #[test]
    fn xml_contains_vm_name_and_resources() {
        let config = Config::default();
        let xml = generate_domain_xml(&config, &project(), None);
        assert!(xml.contains("<name>test-vm</name>"));
        assert!(xml.contains("<memory unit='KiB'>4194304</memory>"));
        assert!(xml.contains("<vcpu>4</vcpu>"));
        assert!(xml.contains("<cpu mode='host-passthrough'/>"));
    }

    #[test]
    fn xml_uses_project_paths() {
        let xml = generate_domain_xml(&Config::default(), &project(), None);
        assert!(xml.contains("<source file='/srv/vms/test-vm/test-vm.qcow2'/>"));
        assert!(xml.contains("<source file='/srv/vms/test-vm/test-vm-seed.iso'/>"));
    }

    #[test]
    fn xml_has_interactive_and_file_backed_serial_lines() {
        let xml = generate_domain_xml(&Config::default(), &project(), None);
        assert!(xml.contains("<serial type='pty'>"));
        assert!(xml.contains("<log file='/srv/vms/test-vm/test-vm-serial.log' append='on'/>"));
        assert!(xml.contains("<serial type='file'>"));
        assert!(xml.contains("<source path='/srv/vms/test-vm/test-vm-console.log' append='on'/>"));
        assert!(xml.contains("<target port='1'/>"));
        assert!(xml.contains("<console type='pty'>"));
    }

    #[test]
    fn share_adds_virtiofs_and_shared_memory() {
        let dir = PathBuf::from("/home/dev/driver_projects");
        let share = Share {
            dir: &dir,
            tag: "host_share",
        };
        let xml = generate_domain_xml(&Config::default(), &project(), Some(&share));
        assert!(xml.contains("<driver type='virtiofs'/>"));
        assert!(xml.contains("<source dir='/home/dev/driver_projects'/>"));
        assert!(xml.contains("<target dir='host_share'/>"));
        assert!(xml.contains("<access mode='shared'/>"));
    }

    /// `source dir`/`file`/`path` attributes of the generated XML, unescaped.
    fn source_attrs(xml: &str) -> Vec<String> {
        let mut reader = Reader::from_str(xml);
        let mut values = Vec::new();
        loop {
            match reader.read_event().unwrap() {
                Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"source" => {
                    for key in ["dir", "file", "path"] {
                        if let Some(v) = attr(&e, key).unwrap() {
                            values.push(v);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        values
    }

    #[test]
    fn special_characters_in_paths_are_escaped() {
        let project = VmProject::new("test-vm", Path::new("/srv/o'neil & <co>"));
        let dir = PathBuf::from("/home/dev/\"quoted\" & 'single'");
        let share = Share {
            dir: &dir,
            tag: "a&b",
        };
        let xml = generate_domain_xml(&Config::default(), &project, Some(&share));

        assert!(xml.contains("/srv/o&apos;neil &amp; &lt;co&gt;/test-vm/test-vm.qcow2"));
        assert!(xml.contains("<target dir='a&amp;b'/>"));
        assert!(!xml.contains("o'neil"));

        let values = source_attrs(&xml);
        assert!(values.contains(&"/home/dev/\"quoted\" & 'single'".to_string()));
        assert!(values.contains(&"/srv/o'neil & <co>/test-vm/test-vm.qcow2".to_string()));
        assert!(values.contains(&"/srv/o'neil & <co>/test-vm/test-vm-console.log".to_string()));
    }

    #[test]
    fn no_share_means_no_memfd_backing() {
        let xml = generate_domain_xml(&Config::default(), &project(), None);
        assert!(!xml.contains("memoryBacking"));
        assert!(!xml.contains("virtiofs"));
    }

    #[test]
    fn hostdev_xml_is_keyed_by_vendor_and_product() {
        let xml = usb_hostdev_xml(UsbId::new(0x1234, 0x5678), None);
        assert!(xml.contains("<hostdev mode='subsystem' type='usb' managed='yes'>"));
        assert!(xml.contains("<vendor id='0x1234'/>"));
        assert!(xml.contains("<product id='0x5678'/>"));
        assert!(!xml.contains("<address"));
    }

    #[test]
    fn hostdev_xml_with_address() {
        let xml = usb_hostdev_xml(
            UsbId::new(0x0bda, 0x8153),
            Some(BusAddress { bus: 2, device: 7 }),
        );
        assert!(xml.contains("<vendor id='0x0bda'/>"));
        assert!(xml.contains("<address bus='2' device='7'/>"));
    }

    #[test]
    fn parse_hostdevs_from_live_xml() {
        let xml = r#"<domain type='kvm'>
  <name>vm</name>
  <devices>
    <disk type='file' device='disk'><source file='/x.qcow2'/></disk>
    <hostdev mode='subsystem' type='usb' managed='yes'>
      <source>
        <vendor id='0x1234'/>
        <product id='0x5678'/>
        <address bus='1' device='4'/>
      </source>
      <alias name='hostdev0'/>
      <address type='usb' bus='0' port='1'/>
    </hostdev>
    <hostdev mode='subsystem' type='usb' managed='yes'>
      <source>
        <vendor id='0x046d'/>
        <product id='0xc52b'/>
      </source>
    </hostdev>
    <hostdev mode='subsystem' type='pci' managed='yes'>
      <source>
        <address domain='0x0000' bus='0x01' slot='0x00' function='0x0'/>
      </source>
    </hostdev>
  </devices>
</domain>"#;
        let devs = parse_usb_hostdevs(xml).unwrap();
        assert_eq!(devs.len(), 2);
        assert_eq!(devs[0].id, UsbId::new(0x1234, 0x5678));
        assert_eq!(devs[0].address, Some(BusAddress { bus: 1, device: 4 }));
        assert_eq!(devs[1].id, UsbId::new(0x046d, 0xc52b));
        assert_eq!(devs[1].address, None);
    }

    #[test]
    fn parse_generated_hostdev_round_trips() {
        let xml = format!(
            "<domain><devices>{}</devices></domain>",
            usb_hostdev_xml(UsbId::new(0xabcd, 0x0001), None)
        );
        let devs = parse_usb_hostdevs(&xml).unwrap();
        assert_eq!(devs, vec![Hostdev { id: UsbId::new(0xabcd, 0x0001), address: None }]);
    }

    #[test]
    fn parse_domain_without_hostdevs() {
        let devs = parse_usb_hostdevs("<domain><devices/></domain>").unwrap();
        assert!(devs.is_empty());
    }
}
