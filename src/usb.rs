//! USB passthrough manager.
//!
//! Host enumeration is the source of truth for which devices exist; the
//! hypervisor's live domain state is the source of truth for which VM owns
//! them. Nothing here is cached between calls.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::domain_xml;
use crate::error::VmError;
use crate::hypervisor::{Hypervisor, PowerState};

/// Linux Foundation vendor id, used by root hubs.
const ROOT_HUB_VENDOR: u16 = 0x1d6b;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl UsbId {
    pub fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

impl std::str::FromStr for UsbId {
    type Err = VmError;

    /// Parses `vvvv:pppp` as printed by `lsusb`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VmError::Validation {
            message: format!("USB id must look like 1234:abcd (got '{s}')"),
        };
        let (vendor, product) = s.trim().split_once(':').ok_or_else(invalid)?;
        let vendor = u16::from_str_radix(vendor, 16).map_err(|_| invalid())?;
        let product = u16::from_str_radix(product, 16).map_err(|_| invalid())?;
        Ok(Self { vendor, product })
    }
}

/// Physical location of a device on the host, for telling apart
/// identical vendor/product pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusAddress {
    pub bus: u16,
    pub device: u16,
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}/{:03}", self.bus, self.device)
    }
}

/// A USB device present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub id: UsbId,
    pub bus_address: Option<BusAddress>,
    pub name: String,
}

/// A USB passthrough entry found in a domain's live definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hostdev {
    pub id: UsbId,
    pub address: Option<BusAddress>,
}

impl Hostdev {
    fn matches(&self, device: &UsbDevice) -> bool {
        self.id == device.id
            && match (self.address, device.bus_address) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Free,
    Attached(String),
}

impl Attachment {
    pub fn owner(&self) -> Option<&str> {
        match self {
            Attachment::Free => None,
            Attachment::Attached(vm) => Some(vm),
        }
    }
}

impl fmt::Display for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attachment::Free => f.write_str("free"),
            Attachment::Attached(vm) => write!(f, "attached({vm})"),
        }
    }
}

/// A host device joined with its live attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub device: UsbDevice,
    pub attachment: Attachment,
}

/// Source of host USB devices.
pub trait UsbHost {
    fn enumerate(&self) -> Result<Vec<UsbDevice>, VmError>;
}

/// Enumerates devices from `/sys/bus/usb/devices`.
pub struct SysfsUsbHost {
    root: PathBuf,
}

impl SysfsUsbHost {
    pub fn new() -> Self {
        Self::with_root("/sys/bus/usb/devices")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsUsbHost {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbHost for SysfsUsbHost {
    fn enumerate(&self) -> Result<Vec<UsbDevice>, VmError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(VmError::Io {
                    context: format!("reading {}", self.root.display()),
                    source: e,
                });
            }
        };

        let mut devices: Vec<UsbDevice> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| read_sysfs_device(&e.path()))
            .filter(|d| d.id.vendor != ROOT_HUB_VENDOR)
            .collect();

        devices.sort_by_key(|d| (d.bus_address.map(|a| (a.bus, a.device)), d.id));
        tracing::debug!(count = devices.len(), "enumerated host USB devices");
        Ok(devices)
    }
}

/// Interfaces (`1-1:1.0`) have no idVendor file and are skipped.
fn read_sysfs_device(dir: &Path) -> Option<UsbDevice> {
    let read = |file: &str| {
        std::fs::read_to_string(dir.join(file))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let vendor = u16::from_str_radix(&read("idVendor")?, 16).ok()?;
    let product = u16::from_str_radix(&read("idProduct")?, 16).ok()?;

    let bus_address = match (read("busnum"), read("devnum")) {
        (Some(bus), Some(dev)) => match (bus.parse(), dev.parse()) {
            (Ok(bus), Ok(device)) => Some(BusAddress { bus, device }),
            _ => None,
        },
        _ => None,
    };

    let name = match (read("manufacturer"), read("product")) {
        (Some(m), Some(p)) => format!("{m} {p}"),
        (None, Some(p)) => p,
        (Some(m), None) => m,
        (None, None) => String::new(),
    };

    Some(UsbDevice {
        id: UsbId { vendor, product },
        bus_address,
        name,
    })
}

/// Tracks host devices and their attachment to VMs.
pub struct UsbManager<'a, H: Hypervisor, U: UsbHost> {
    hypervisor: &'a H,
    host: &'a U,
}

impl<'a, H: Hypervisor, U: UsbHost> UsbManager<'a, H, U> {
    pub fn new(hypervisor: &'a H, host: &'a U) -> Self {
        Self { hypervisor, host }
    }

    pub fn enumerate_host_devices(&self) -> Result<Vec<UsbDevice>, VmError> {
        self.host.enumerate()
    }

    /// Host devices with their live attachment, re-read on every call.
    pub fn devices(&self) -> Result<Vec<DeviceEntry>, VmError> {
        let devices = self.enumerate_host_devices()?;
        let owners = self.live_hostdevs()?;

        Ok(devices
            .into_iter()
            .map(|device| {
                let attachment = owners
                    .iter()
                    .find(|(_, hostdev)| hostdev.matches(&device))
                    .map(|(vm, _)| Attachment::Attached(vm.clone()))
                    .unwrap_or(Attachment::Free);
                DeviceEntry { device, attachment }
            })
            .collect())
    }

    /// Devices currently passed through to `vm`.
    pub fn attached_to(&self, vm: &str) -> Result<Vec<Hostdev>, VmError> {
        match self.hypervisor.domain_state(vm)? {
            PowerState::Undefined => Ok(Vec::new()),
            _ => self.hypervisor.list_devices(vm),
        }
    }

    /// Refuse a power-down of `vm` while anything is still passed through.
    pub fn ensure_detached(&self, vm: &str) -> Result<(), VmError> {
        let attached = self.attached_to(vm)?;
        if attached.is_empty() {
            return Ok(());
        }
        let devices: Vec<String> = attached.iter().map(|h| h.id.to_string()).collect();
        tracing::warn!(vm, ?devices, "power transition blocked by passthrough devices");
        Err(VmError::PassthroughStillAttached {
            vm: vm.to_string(),
            devices,
        })
    }

    /// Attach a free device to `target_vm`, or detach it if `target_vm`
    /// already owns it. Returns the new attachment.
    pub fn toggle(&self, device: &UsbDevice, target_vm: &str) -> Result<Attachment, VmError> {
        let current = self.attachment_of(device)?;
        match current {
            Attachment::Attached(owner) if owner != target_vm => Err(VmError::WrongOwner {
                device: device.id.to_string(),
                owner,
                target: target_vm.to_string(),
            }),
            Attachment::Attached(_) => {
                self.detach(device, target_vm)?;
                Ok(Attachment::Free)
            }
            Attachment::Free => {
                let state = self.hypervisor.domain_state(target_vm)?;
                if state != PowerState::Running {
                    return Err(VmError::NotRunning {
                        name: target_vm.to_string(),
                        state,
                    });
                }
                let xml = domain_xml::usb_hostdev_xml(device.id, self.disambiguating_address(device)?);
                self.hypervisor
                    .attach_device(target_vm, &xml)
                    .map_err(|e| busy(device, "attach", e))?;
                tracing::info!(vm = target_vm, device = %device.id, "attached USB device");
                Ok(Attachment::Attached(target_vm.to_string()))
            }
        }
    }

    /// Toggle by id, picking the first host device with that id.
    pub fn toggle_id(&self, id: UsbId, target_vm: &str) -> Result<Attachment, VmError> {
        let device = self
            .enumerate_host_devices()?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| VmError::DeviceNotFound {
                device: id.to_string(),
            })?;
        self.toggle(&device, target_vm)
    }

    /// Detach every passthrough device from `vm`. Returns how many were removed.
    pub fn detach_all(&self, vm: &str) -> Result<usize, VmError> {
        let attached = self.attached_to(vm)?;
        for hostdev in &attached {
            let xml = domain_xml::usb_hostdev_xml(hostdev.id, hostdev.address);
            self.hypervisor
                .detach_device(vm, &xml)
                .map_err(|e| busy_id(hostdev.id, "detach", e))?;
            tracing::info!(vm, device = %hostdev.id, "detached USB device");
        }
        Ok(attached.len())
    }

    fn detach(&self, device: &UsbDevice, vm: &str) -> Result<(), VmError> {
        // Detach with the exact descriptor the domain holds.
        let hostdev = self
            .hypervisor
            .list_devices(vm)?
            .into_iter()
            .find(|h| h.matches(device))
            .unwrap_or(Hostdev {
                id: device.id,
                address: None,
            });
        let xml = domain_xml::usb_hostdev_xml(hostdev.id, hostdev.address);
        self.hypervisor
            .detach_device(vm, &xml)
            .map_err(|e| busy(device, "detach", e))?;
        tracing::info!(vm, device = %device.id, "detached USB device");
        Ok(())
    }

    fn attachment_of(&self, device: &UsbDevice) -> Result<Attachment, VmError> {
        Ok(self
            .live_hostdevs()?
            .into_iter()
            .find(|(_, hostdev)| hostdev.matches(device))
            .map(|(vm, _)| Attachment::Attached(vm))
            .unwrap_or(Attachment::Free))
    }

    fn disambiguating_address(&self, device: &UsbDevice) -> Result<Option<BusAddress>, VmError> {
        let twins = self
            .enumerate_host_devices()?
            .iter()
            .filter(|d| d.id == device.id)
            .count();
        Ok(if twins > 1 { device.bus_address } else { None })
    }

    /// `(vm, hostdev)` for every passthrough device of every active domain.
    fn live_hostdevs(&self) -> Result<Vec<(String, Hostdev)>, VmError> {
        let mut owners = Vec::new();
        for vm in self.hypervisor.list_domains()? {
            if !self.hypervisor.domain_state(&vm)?.is_active() {
                continue;
            }
            for hostdev in self.hypervisor.list_devices(&vm)? {
                owners.push((vm.clone(), hostdev));
            }
        }
        Ok(owners)
    }
}

fn busy(device: &UsbDevice, action: &'static str, e: VmError) -> VmError {
    busy_id(device.id, action, e)
}

fn busy_id(id: UsbId, action: &'static str, e: VmError) -> VmError {
    let message = match e {
        VmError::ExternalToolFailure { message, .. } => message,
        other => other.to_string(),
    };
    VmError::DeviceBusy {
        device: id.to_string(),
        action,
        message,
    }
}

/// Fixed device list for tests.
#[cfg(test)]
pub struct StaticUsbHost(pub Vec<UsbDevice>);

#[cfg(test)]
impl UsbHost for StaticUsbHost {
    fn enumerate(&self) -> Result<Vec<UsbDevice>, VmError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;

    fn device(vendor: u16, product: u16) -> UsbDevice {
        UsbDevice {
            id: UsbId::new(vendor, product),
            bus_address: None,
            name: "Test Device".into(),
        }
    }

    fn running(hv: &FakeHypervisor, name: &str) {
        hv.insert_domain(name, PowerState::Running);
    }

    #[test]
    fn usb_id_parses_lsusb_format() {
        let id: UsbId = "1234:5678".parse().unwrap();
        assert_eq!(id, UsbId::new(0x1234, 0x5678));
        assert_eq!(id.to_string(), "1234:5678");
        assert!("12345678".parse::<UsbId>().is_err());
        assert!("zzzz:0001".parse::<UsbId>().is_err());
    }

    #[test]
    fn free_device_attaches_to_running_vm() {
        let hv = FakeHypervisor::new();
        running(&hv, "vm-a");
        let host = StaticUsbHost(vec![device(0x1234, 0x5678)]);
        let usb = UsbManager::new(&hv, &host);

        let state = usb.toggle(&host.0[0], "vm-a").unwrap();
        assert_eq!(state, Attachment::Attached("vm-a".into()));

        let entries = usb.devices().unwrap();
        assert_eq!(entries[0].attachment, Attachment::Attached("vm-a".into()));
    }

    #[test]
    fn toggling_owned_device_detaches_it() {
        let hv = FakeHypervisor::new();
        running(&hv, "vm-a");
        let host = StaticUsbHost(vec![device(0x1234, 0x5678)]);
        let usb = UsbManager::new(&hv, &host);

        usb.toggle(&host.0[0], "vm-a").unwrap();
        let state = usb.toggle(&host.0[0], "vm-a").unwrap();
        assert_eq!(state, Attachment::Free);
        assert_eq!(usb.devices().unwrap()[0].attachment, Attachment::Free);
    }

    #[test]
    fn device_owned_by_another_vm_is_rejected() {
        let hv = FakeHypervisor::new();
        running(&hv, "vm-a");
        running(&hv, "vm-b");
        let host = StaticUsbHost(vec![device(0x1234, 0x5678)]);
        let usb = UsbManager::new(&hv, &host);

        usb.toggle(&host.0[0], "vm-a").unwrap();
        let err = usb.toggle(&host.0[0], "vm-b").unwrap_err();
        assert!(matches!(err, VmError::WrongOwner { ref owner, .. } if owner == "vm-a"));

        // Ownership unchanged, and vm-b never received an attach call.
        assert_eq!(
            usb.devices().unwrap()[0].attachment,
            Attachment::Attached("vm-a".into())
        );
        assert!(hv.list_devices("vm-b").unwrap().is_empty());
    }

    #[test]
    fn attach_requires_running_target() {
        let hv = FakeHypervisor::new();
        hv.insert_domain("vm-a", PowerState::Stopped);
        let host = StaticUsbHost(vec![device(0x1234, 0x5678)]);
        let usb = UsbManager::new(&hv, &host);

        let err = usb.toggle(&host.0[0], "vm-a").unwrap_err();
        assert!(matches!(err, VmError::NotRunning { .. }));
        assert_eq!(hv.calls_to("attach_device"), 0);
    }

    #[test]
    fn hypervisor_rejection_is_device_busy() {
        let hv = FakeHypervisor::new();
        running(&hv, "vm-a");
        hv.fail_next("attach_device", "device is in use by another process");
        let host = StaticUsbHost(vec![device(0x1234, 0x5678)]);
        let usb = UsbManager::new(&hv, &host);

        let err = usb.toggle(&host.0[0], "vm-a").unwrap_err();
        match err {
            VmError::DeviceBusy { action, message, .. } => {
                assert_eq!(action, "attach");
                assert!(message.contains("in use"));
            }
            other => panic!("expected DeviceBusy, got {other:?}"),
        }
        assert_eq!(usb.devices().unwrap()[0].attachment, Attachment::Free);
    }

    #[test]
    fn ensure_detached_lists_remaining_devices() {
        let hv = FakeHypervisor::new();
        running(&hv, "vm-a");
        let host = StaticUsbHost(vec![device(0x1234, 0x5678), device(0x046d, 0xc52b)]);
        let usb = UsbManager::new(&hv, &host);

        assert!(usb.ensure_detached("vm-a").is_ok());
        usb.toggle(&host.0[0], "vm-a").unwrap();
        usb.toggle(&host.0[1], "vm-a").unwrap();

        match usb.ensure_detached("vm-a").unwrap_err() {
            VmError::PassthroughStillAttached { vm, devices } => {
                assert_eq!(vm, "vm-a");
                assert_eq!(devices, vec!["1234:5678", "046d:c52b"]);
            }
            other => panic!("expected PassthroughStillAttached, got {other:?}"),
        }

        assert_eq!(usb.detach_all("vm-a").unwrap(), 2);
        assert!(usb.ensure_detached("vm-a").is_ok());
    }

    #[test]
    fn identical_ids_are_told_apart_by_address() {
        let hv = FakeHypervisor::new();
        running(&hv, "vm-a");
        let mut first = device(0x0781, 0x5581);
        first.bus_address = Some(BusAddress { bus: 1, device: 3 });
        let mut second = device(0x0781, 0x5581);
        second.bus_address = Some(BusAddress { bus: 2, device: 5 });
        let host = StaticUsbHost(vec![first.clone(), second.clone()]);
        let usb = UsbManager::new(&hv, &host);

        usb.toggle(&second, "vm-a").unwrap();
        let entries = usb.devices().unwrap();
        assert_eq!(entries[0].attachment, Attachment::Free);
        assert_eq!(entries[1].attachment, Attachment::Attached("vm-a".into()));
    }

    #[test]
    fn toggle_id_reports_missing_device() {
        let hv = FakeHypervisor::new();
        running(&hv, "vm-a");
        let host = StaticUsbHost(vec![]);
        let usb = UsbManager::new(&hv, &host);
        let err = usb.toggle_id(UsbId::new(0xdead, 0xbeef), "vm-a").unwrap_err();
        assert!(matches!(err, VmError::DeviceNotFound { .. }));
    }

    #[test]
    fn sysfs_enumeration_skips_interfaces_and_root_hubs() {
        let dir = tempfile::tempdir().unwrap();
        let write = |entry: &str, files: &[(&str, &str)]| {
            let path = dir.path().join(entry);
            std::fs::create_dir_all(&path).unwrap();
            for (name, content) in files {
                std::fs::write(path.join(name), format!("{content}\n")).unwrap();
            }
        };
        write(
            "usb1",
            &[("idVendor", "1d6b"), ("idProduct", "0002"), ("busnum", "1"), ("devnum", "1")],
        );
        write(
            "1-2",
            &[
                ("idVendor", "1234"),
                ("idProduct", "5678"),
                ("busnum", "1"),
                ("devnum", "4"),
                ("manufacturer", "Acme"),
                ("product", "Debug Probe"),
            ],
        );
        write("1-2:1.0", &[("bInterfaceClass", "ff")]);

        let devices = SysfsUsbHost::with_root(dir.path()).enumerate().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, UsbId::new(0x1234, 0x5678));
        assert_eq!(devices[0].bus_address, Some(BusAddress { bus: 1, device: 4 }));
        assert_eq!(devices[0].name, "Acme Debug Probe");
    }

    #[test]
    fn missing_sysfs_root_is_empty() {
        let host = SysfsUsbHost::with_root("/nonexistent/sys/bus/usb/devices");
        assert!(host.enumerate().unwrap().is_empty());
    }
}
