use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;
use virt::network::Network;
use virt::sys;

use super::{Hypervisor, PowerState};
use crate::domain_xml;
use crate::error::VmError;
use crate::usb::Hostdev;

/// libvirt adapter. Holds one connection for the lifetime of the command.
pub struct LibvirtHypervisor {
    conn: Connect,
    uri: String,
}

impl LibvirtHypervisor {
    pub fn connect(uri: &str) -> Result<Self, VmError> {
        // Keep libvirt from printing its own errors to stderr; they are
        // surfaced through Result instead.
        virt_error::clear_error_callback();

        let conn = Connect::open(Some(uri)).map_err(|e| {
            VmError::external(
                "libvirt",
                format!(
                    "failed to connect to {uri}: {e} \
                     (is libvirtd running, and are you root or in the libvirt group?)"
                ),
            )
        })?;
        tracing::debug!(uri, "connected to libvirt");
        Ok(Self {
            conn,
            uri: uri.to_string(),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn lookup(&self, name: &str) -> Result<Domain, VmError> {
        Domain::lookup_by_name(&self.conn, name)
            .map_err(|e| VmError::external("libvirt", format!("domain lookup for '{name}' failed: {e}")))
    }

    /// The NAT network every VM plugs into must be up before start.
    fn ensure_default_network(&self) -> Result<(), VmError> {
        let net = Network::lookup_by_name(&self.conn, "default").map_err(|_| {
            VmError::external(
                "libvirt",
                "default network not found; run `virsh net-define /usr/share/libvirt/networks/default.xml`",
            )
        })?;

        if !net.is_active().unwrap_or(false) {
            tracing::info!("starting inactive default network");
            net.create()
                .map_err(|e| VmError::external("libvirt", format!("failed to start default network: {e}")))?;
            let _ = net.set_autostart(true);
        }
        Ok(())
    }
}

impl Drop for LibvirtHypervisor {
    fn drop(&mut self) {
        self.conn.close().ok();
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn list_domains(&self) -> Result<Vec<String>, VmError> {
        let domains = self
            .conn
            .list_all_domains(0)
            .map_err(|e| VmError::external("libvirt", format!("listing domains failed: {e}")))?;
        Ok(domains.iter().filter_map(|d| d.get_name().ok()).collect())
    }

    fn domain_state(&self, name: &str) -> Result<PowerState, VmError> {
        let Ok(dom) = Domain::lookup_by_name(&self.conn, name) else {
            return Ok(PowerState::Undefined);
        };
        let (state, _reason) = dom
            .get_state()
            .map_err(|e| VmError::external("libvirt", format!("reading state of '{name}' failed: {e}")))?;

        Ok(match state {
            sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED => PowerState::Running,
            sys::VIR_DOMAIN_PAUSED | sys::VIR_DOMAIN_PMSUSPENDED => PowerState::Paused,
            // A guest mid-shutdown still owns its devices.
            sys::VIR_DOMAIN_SHUTDOWN => PowerState::Running,
            _ => {
                if dom.has_managed_save(0).unwrap_or(false) {
                    PowerState::Saved
                } else {
                    PowerState::Stopped
                }
            }
        })
    }

    fn define(&self, name: &str, xml: &str) -> Result<(), VmError> {
        Domain::define_xml(&self.conn, xml)
            .map_err(|e| VmError::external("libvirt", format!("failed to define '{name}': {e}")))?;
        tracing::info!(name, "domain defined");
        Ok(())
    }

    fn undefine(&self, name: &str) -> Result<(), VmError> {
        let flags = (sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE | sys::VIR_DOMAIN_UNDEFINE_NVRAM) as u32;
        self.lookup(name)?
            .undefine_flags(flags)
            .map_err(|e| VmError::external("libvirt", format!("failed to undefine '{name}': {e}")))?;
        tracing::info!(name, "domain undefined");
        Ok(())
    }

    fn start(&self, name: &str) -> Result<(), VmError> {
        self.ensure_default_network()?;
        self.lookup(name)?
            .create()
            .map_err(|e| VmError::external("libvirt", format!("failed to start '{name}': {e}")))?;
        tracing::info!(name, "domain started");
        Ok(())
    }

    fn start_from_save(&self, name: &str) -> Result<(), VmError> {
        // create() restores from the managed-save image when one exists
        self.ensure_default_network()?;
        self.lookup(name)?
            .create()
            .map_err(|e| VmError::external("libvirt", format!("failed to restore '{name}': {e}")))?;
        tracing::info!(name, "domain restored from managed save");
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<(), VmError> {
        self.lookup(name)?
            .destroy()
            .map_err(|e| VmError::external("libvirt", format!("failed to force stop '{name}': {e}")))?;
        tracing::info!(name, "domain destroyed");
        Ok(())
    }

    fn shutdown(&self, name: &str) -> Result<(), VmError> {
        self.lookup(name)?
            .shutdown()
            .map_err(|e| VmError::external("libvirt", format!("ACPI shutdown of '{name}' failed: {e}")))?;
        tracing::info!(name, "sent ACPI shutdown");
        Ok(())
    }

    fn managed_save(&self, name: &str) -> Result<(), VmError> {
        self.lookup(name)?
            .managed_save(0)
            .map_err(|e| VmError::external("libvirt", format!("managed save of '{name}' failed: {e}")))?;
        tracing::info!(name, "domain saved");
        Ok(())
    }

    fn managed_save_remove(&self, name: &str) -> Result<(), VmError> {
        self.lookup(name)?
            .managed_save_remove(0)
            .map_err(|e| {
                VmError::external("libvirt", format!("removing saved state of '{name}' failed: {e}"))
            })?;
        tracing::info!(name, "managed save image discarded");
        Ok(())
    }

    fn suspend(&self, name: &str) -> Result<(), VmError> {
        self.lookup(name)?
            .suspend()
            .map_err(|e| VmError::external("libvirt", format!("failed to pause '{name}': {e}")))?;
        tracing::info!(name, "domain paused");
        Ok(())
    }

    fn resume(&self, name: &str) -> Result<(), VmError> {
        self.lookup(name)?
            .resume()
            .map_err(|e| VmError::external("libvirt", format!("failed to resume '{name}': {e}")))?;
        tracing::info!(name, "domain resumed");
        Ok(())
    }

    fn attach_device(&self, name: &str, xml: &str) -> Result<(), VmError> {
        self.lookup(name)?
            .attach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_LIVE as u32)
            .map_err(|e| VmError::external("libvirt", e))?;
        Ok(())
    }

    fn detach_device(&self, name: &str, xml: &str) -> Result<(), VmError> {
        self.lookup(name)?
            .detach_device_flags(xml, sys::VIR_DOMAIN_AFFECT_LIVE as u32)
            .map_err(|e| VmError::external("libvirt", e))?;
        Ok(())
    }

    fn list_devices(&self, name: &str) -> Result<Vec<Hostdev>, VmError> {
        let xml = self
            .lookup(name)?
            .get_xml_desc(0)
            .map_err(|e| VmError::external("libvirt", format!("reading XML of '{name}' failed: {e}")))?;
        domain_xml::parse_usb_hostdevs(&xml)
    }
}
