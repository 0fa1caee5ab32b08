//! In-memory hypervisor for tests.

use std::cell::RefCell;
use std::collections::BTreeMap;

use super::{Hypervisor, PowerState};
use crate::domain_xml;
use crate::error::VmError;
use crate::usb::Hostdev;

#[derive(Debug, Default)]
struct FakeDomain {
    state: Option<PowerState>,
    xml: String,
    devices: Vec<Hostdev>,
    boots: u32,
    /// Freshly defined domains power themselves off at the end of their
    /// first boot, like a cloud-init install does.
    installing: bool,
}

#[derive(Default)]
struct Inner {
    domains: BTreeMap<String, FakeDomain>,
    calls: Vec<(&'static str, String)>,
    failures: Vec<(&'static str, String)>,
    ignore_acpi: bool,
    hang_install: bool,
}

#[derive(Default)]
pub struct FakeHypervisor {
    inner: RefCell<Inner>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_domain(&self, name: &str, state: PowerState) {
        self.inner.borrow_mut().domains.insert(
            name.to_string(),
            FakeDomain {
                state: Some(state),
                ..Default::default()
            },
        );
    }

    /// Change state behind the controller's back.
    pub fn set_state(&self, name: &str, state: PowerState) {
        if let Some(d) = self.inner.borrow_mut().domains.get_mut(name) {
            d.state = Some(state);
        }
    }

    /// Make the next call to `op` fail with `message`.
    pub fn fail_next(&self, op: &'static str, message: &str) {
        self.inner
            .borrow_mut()
            .failures
            .push((op, message.to_string()));
    }

    /// Guests ignore ACPI power button presses.
    pub fn ignore_acpi(&self) {
        self.inner.borrow_mut().ignore_acpi = true;
    }

    /// Fresh installs never power themselves off.
    pub fn hang_install(&self) {
        self.inner.borrow_mut().hang_install = true;
    }

    pub fn calls_to(&self, op: &str) -> usize {
        self.inner
            .borrow()
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .count()
    }

    pub fn boots(&self, name: &str) -> u32 {
        self.inner
            .borrow()
            .domains
            .get(name)
            .map(|d| d.boots)
            .unwrap_or(0)
    }

    pub fn xml(&self, name: &str) -> Option<String> {
        self.inner.borrow().domains.get(name).map(|d| d.xml.clone())
    }

    fn record(&self, op: &'static str, name: &str) -> Result<(), VmError> {
        let mut inner = self.inner.borrow_mut();
        inner.calls.push((op, name.to_string()));
        if let Some(pos) = inner.failures.iter().position(|(o, _)| *o == op) {
            let (_, message) = inner.failures.remove(pos);
            return Err(VmError::external("fake", message));
        }
        Ok(())
    }

    fn with_domain<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FakeDomain) -> Result<T, VmError>,
    ) -> Result<T, VmError> {
        let mut inner = self.inner.borrow_mut();
        let domain = inner
            .domains
            .get_mut(name)
            .ok_or_else(|| VmError::external("fake", format!("Domain not found: '{name}'")))?;
        f(domain)
    }

    fn require(domain: &FakeDomain, wanted: &[PowerState], op: &str) -> Result<(), VmError> {
        let state = domain.state.unwrap_or(PowerState::Stopped);
        if wanted.contains(&state) {
            Ok(())
        } else {
            Err(VmError::external(
                "fake",
                format!("Requested operation is not valid: {op} while {state}"),
            ))
        }
    }
}

impl Hypervisor for FakeHypervisor {
    fn list_domains(&self) -> Result<Vec<String>, VmError> {
        self.record("list_domains", "")?;
        Ok(self.inner.borrow().domains.keys().cloned().collect())
    }

    fn domain_state(&self, name: &str) -> Result<PowerState, VmError> {
        self.record("domain_state", name)?;
        Ok(self
            .inner
            .borrow()
            .domains
            .get(name)
            .and_then(|d| d.state)
            .unwrap_or(PowerState::Undefined))
    }

    fn define(&self, name: &str, xml: &str) -> Result<(), VmError> {
        self.record("define", name)?;
        let mut inner = self.inner.borrow_mut();
        let domain = inner.domains.entry(name.to_string()).or_default();
        domain.xml = xml.to_string();
        domain.state.get_or_insert(PowerState::Stopped);
        domain.installing = true;
        Ok(())
    }

    fn undefine(&self, name: &str) -> Result<(), VmError> {
        self.record("undefine", name)?;
        let mut inner = self.inner.borrow_mut();
        match inner.domains.get(name).and_then(|d| d.state) {
            Some(s) if s.is_active() => Err(VmError::external(
                "fake",
                "cannot undefine an active domain in this fake",
            )),
            Some(_) => {
                inner.domains.remove(name);
                Ok(())
            }
            None => Err(VmError::external("fake", format!("Domain not found: '{name}'"))),
        }
    }

    fn start(&self, name: &str) -> Result<(), VmError> {
        self.record("start", name)?;
        let hang = self.inner.borrow().hang_install;
        self.with_domain(name, |d| {
            Self::require(d, &[PowerState::Stopped, PowerState::Saved], "start")?;
            d.boots += 1;
            if d.installing && !hang {
                d.installing = false;
                d.state = Some(PowerState::Stopped);
            } else {
                d.state = Some(PowerState::Running);
            }
            Ok(())
        })
    }

    fn start_from_save(&self, name: &str) -> Result<(), VmError> {
        self.record("start_from_save", name)?;
        self.with_domain(name, |d| {
            Self::require(d, &[PowerState::Saved], "restore")?;
            d.state = Some(PowerState::Running);
            Ok(())
        })
    }

    fn destroy(&self, name: &str) -> Result<(), VmError> {
        self.record("destroy", name)?;
        self.with_domain(name, |d| {
            Self::require(d, &[PowerState::Running, PowerState::Paused], "destroy")?;
            d.state = Some(PowerState::Stopped);
            d.devices.clear();
            Ok(())
        })
    }

    fn shutdown(&self, name: &str) -> Result<(), VmError> {
        self.record("shutdown", name)?;
        let ignore = self.inner.borrow().ignore_acpi;
        self.with_domain(name, |d| {
            Self::require(d, &[PowerState::Running], "shutdown")?;
            if !ignore {
                d.state = Some(PowerState::Stopped);
                d.devices.clear();
            }
            Ok(())
        })
    }

    fn managed_save(&self, name: &str) -> Result<(), VmError> {
        self.record("managed_save", name)?;
        self.with_domain(name, |d| {
            Self::require(d, &[PowerState::Running, PowerState::Paused], "managed save")?;
            d.state = Some(PowerState::Saved);
            Ok(())
        })
    }

    fn managed_save_remove(&self, name: &str) -> Result<(), VmError> {
        self.record("managed_save_remove", name)?;
        self.with_domain(name, |d| {
            Self::require(d, &[PowerState::Saved], "remove managed save")?;
            d.state = Some(PowerState::Stopped);
            Ok(())
        })
    }

    fn suspend(&self, name: &str) -> Result<(), VmError> {
        self.record("suspend", name)?;
        self.with_domain(name, |d| {
            Self::require(d, &[PowerState::Running], "suspend")?;
            d.state = Some(PowerState::Paused);
            Ok(())
        })
    }

    fn resume(&self, name: &str) -> Result<(), VmError> {
        self.record("resume", name)?;
        self.with_domain(name, |d| {
            Self::require(d, &[PowerState::Paused], "resume")?;
            d.state = Some(PowerState::Running);
            Ok(())
        })
    }

    fn attach_device(&self, name: &str, xml: &str) -> Result<(), VmError> {
        self.record("attach_device", name)?;
        let parsed = domain_xml::parse_usb_hostdevs(&format!("<devices>{xml}</devices>"))?;
        self.with_domain(name, |d| {
            Self::require(d, &[PowerState::Running], "attach")?;
            d.devices.extend(parsed);
            Ok(())
        })
    }

    fn detach_device(&self, name: &str, xml: &str) -> Result<(), VmError> {
        self.record("detach_device", name)?;
        let parsed = domain_xml::parse_usb_hostdevs(&format!("<devices>{xml}</devices>"))?;
        self.with_domain(name, |d| {
            for hostdev in parsed {
                let pos = d
                    .devices
                    .iter()
                    .position(|h| h.id == hostdev.id && (hostdev.address.is_none() || h.address == hostdev.address))
                    .ok_or_else(|| VmError::external("fake", "device not found"))?;
                d.devices.remove(pos);
            }
            Ok(())
        })
    }

    fn list_devices(&self, name: &str) -> Result<Vec<Hostdev>, VmError> {
        self.record("list_devices", name)?;
        Ok(self
            .inner
            .borrow()
            .domains
            .get(name)
            .map(|d| d.devices.clone())
            .unwrap_or_default())
    }
}
