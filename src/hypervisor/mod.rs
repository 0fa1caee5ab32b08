//! Hypervisor control interface.
//!
//! The lifecycle controller and the USB manager only ever talk to the
//! virtualization backend through [`Hypervisor`]. Production code uses the
//! libvirt adapter; tests use the in-memory fake.

pub mod libvirt;

#[cfg(test)]
pub mod fake;

use std::fmt;

use crate::error::VmError;
use crate::usb::Hostdev;

/// Live power state of a domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// No domain definition exists.
    Undefined,
    Stopped,
    Running,
    Paused,
    /// Shut off with a managed-save image waiting to be restored.
    Saved,
}

impl PowerState {
    /// States in which the guest still owns its virtual USB bus.
    pub fn is_active(self) -> bool {
        matches!(self, PowerState::Running | PowerState::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::Undefined => "undefined",
            PowerState::Stopped => "stopped",
            PowerState::Running => "running",
            PowerState::Paused => "paused",
            PowerState::Saved => "saved",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations a virtualization backend must expose, keyed by domain name.
///
/// Every call is synchronous and reflects live state; implementations must
/// not cache anything between calls.
pub trait Hypervisor {
    /// Names of all defined domains, active or not.
    fn list_domains(&self) -> Result<Vec<String>, VmError>;

    /// Current power state; `Undefined` when the domain does not exist.
    fn domain_state(&self, name: &str) -> Result<PowerState, VmError>;

    fn define(&self, name: &str, xml: &str) -> Result<(), VmError>;

    /// Remove the definition together with any managed-save image.
    fn undefine(&self, name: &str) -> Result<(), VmError>;

    fn start(&self, name: &str) -> Result<(), VmError>;

    /// Restore a domain from its managed-save image.
    fn start_from_save(&self, name: &str) -> Result<(), VmError>;

    /// Hard power-off.
    fn destroy(&self, name: &str) -> Result<(), VmError>;

    /// Ask the guest to power off via ACPI. Returns before the guest is down.
    fn shutdown(&self, name: &str) -> Result<(), VmError>;

    fn managed_save(&self, name: &str) -> Result<(), VmError>;

    /// Discard a managed-save image so the next start is a cold boot.
    fn managed_save_remove(&self, name: &str) -> Result<(), VmError>;

    fn suspend(&self, name: &str) -> Result<(), VmError>;

    fn resume(&self, name: &str) -> Result<(), VmError>;

    /// Live-hotplug a device described by `xml`.
    fn attach_device(&self, name: &str, xml: &str) -> Result<(), VmError>;

    /// Live-unplug a device described by `xml`.
    fn detach_device(&self, name: &str, xml: &str) -> Result<(), VmError>;

    /// USB host devices currently passed through to the running domain.
    fn list_devices(&self, name: &str) -> Result<Vec<Hostdev>, VmError>;
}

/// Stand-in used when the backend cannot be reached, so read-only views
/// such as `list` still work. Every call fails with the connect error.
pub struct Unavailable {
    reason: String,
}

impl Unavailable {
    pub fn new(reason: impl ToString) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }

    fn fail<T>(&self) -> Result<T, VmError> {
        Err(VmError::external("libvirt", &self.reason))
    }
}

impl Hypervisor for Unavailable {
    fn list_domains(&self) -> Result<Vec<String>, VmError> {
        self.fail()
    }
    fn domain_state(&self, _name: &str) -> Result<PowerState, VmError> {
        self.fail()
    }
    fn define(&self, _name: &str, _xml: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn undefine(&self, _name: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn start(&self, _name: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn start_from_save(&self, _name: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn destroy(&self, _name: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn shutdown(&self, _name: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn managed_save(&self, _name: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn managed_save_remove(&self, _name: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn suspend(&self, _name: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn resume(&self, _name: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn attach_device(&self, _name: &str, _xml: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn detach_device(&self, _name: &str, _xml: &str) -> Result<(), VmError> {
        self.fail()
    }
    fn list_devices(&self, _name: &str) -> Result<Vec<Hostdev>, VmError> {
        self.fail()
    }
}
