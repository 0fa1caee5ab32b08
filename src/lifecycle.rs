//! VM power-state machine.
//!
//! Every operation re-reads the domain state from the hypervisor before
//! deciding anything; nothing here caches state between calls. Any
//! transition that takes a running guest down goes through the USB guard
//! first.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::cloudinit::GuestSeed;
use crate::config::{Config, ImagePreset, InstallConfig};
use crate::domain_xml::{self, Share};
use crate::error::VmError;
use crate::hypervisor::{Hypervisor, PowerState};
use crate::progress::{Step, StepProgress};
use crate::provision::Provisioner;
use crate::registry::{ActiveVm, Conflict, ConsoleTarget, ProjectHealth, Registry, VmProject};
use crate::usb::{Hostdev, UsbHost, UsbManager};
use crate::util::validate_vm_name;

/// Number of steps `create` reports.
pub const CREATE_STEPS: usize = 7;

/// Poll intervals and deadlines for operations that wait on the guest.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub install_timeout: Duration,
    pub poll: Duration,
    pub shutdown_timeout: Duration,
}

impl Timings {
    pub fn from_config(install: &InstallConfig) -> Self {
        Self {
            install_timeout: Duration::from_secs(install.timeout_s),
            poll: Duration::from_millis(install.poll_ms),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Live snapshot of one VM.
#[derive(Debug, Clone)]
pub struct VmStatus {
    pub project: VmProject,
    pub state: PowerState,
    pub health: ProjectHealth,
    pub devices: Vec<Hostdev>,
}

pub struct Controller<'a, H: Hypervisor, U: UsbHost, P: Provisioner> {
    hv: &'a H,
    usb: UsbManager<'a, H, U>,
    provisioner: &'a P,
    config: &'a Config,
    registry: Registry<'a, H>,
    timings: Timings,
}

impl<'a, H: Hypervisor, U: UsbHost, P: Provisioner> Controller<'a, H, U, P> {
    pub fn new(hv: &'a H, usb_host: &'a U, provisioner: &'a P, config: &'a Config) -> Self {
        Self {
            hv,
            usb: UsbManager::new(hv, usb_host),
            provisioner,
            config,
            registry: Registry::new(config.vms_dir(), hv),
            timings: Timings::from_config(&config.install),
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn config(&self) -> &'a Config {
        self.config
    }

    pub fn registry(&self) -> &Registry<'a, H> {
        &self.registry
    }

    pub fn usb(&self) -> &UsbManager<'a, H, U> {
        &self.usb
    }

    pub fn state(&self, name: &str) -> Result<PowerState, VmError> {
        self.hv.domain_state(name)
    }

    pub fn status(&self, name: &str) -> Result<VmStatus, VmError> {
        let project = self.registry.project(name);
        let state = self.hv.domain_state(name)?;
        if state == PowerState::Undefined && !project.directory.exists() {
            return Err(VmError::DomainMissing {
                name: name.to_string(),
            });
        }
        let devices = if state.is_active() {
            self.hv.list_devices(name)?
        } else {
            Vec::new()
        };
        Ok(VmStatus {
            health: self.registry.health(&project),
            project,
            state,
            devices,
        })
    }

    /// Whether a directory or a domain exists under `name`.
    pub fn exists(&self, name: &str) -> Result<bool, VmError> {
        Ok(self.registry.project(name).directory.is_dir()
            || self.hv.domain_state(name)? != PowerState::Undefined)
    }

    /// The VM operations apply to: the selected one while it still exists,
    /// else the first remaining project. `selector` is updated to match.
    pub fn active(&self, selector: &mut ActiveVm) -> Result<String, VmError> {
        if let Some(name) = selector.name()
            && validate_vm_name(name).is_ok()
            && self.exists(name)?
        {
            return Ok(name.to_string());
        }
        let project = self
            .registry
            .resolve_active(selector)
            .ok_or(VmError::NoActiveVm)?;
        selector.select(&project.name);
        Ok(project.name)
    }

    /// Select `name` and persist the choice. Something must exist under it.
    pub fn switch(&self, name: &str, selector: &mut ActiveVm) -> Result<(), VmError> {
        validate_vm_name(name)?;
        if !self.exists(name)? {
            return Err(VmError::DomainMissing {
                name: name.to_string(),
            });
        }
        selector.select(name);
        self.registry.save_selector(selector)?;
        tracing::info!(name, "switched active VM");
        Ok(())
    }

    /// Where to attach for an interactive session. Only a running guest
    /// has a live console.
    pub fn console_target(&self, name: &str) -> Result<ConsoleTarget, VmError> {
        let state = self.hv.domain_state(name)?;
        match state {
            PowerState::Undefined => Err(VmError::DomainMissing {
                name: name.to_string(),
            }),
            PowerState::Running => Ok(self.registry.project(name).console_target()),
            _ => Err(VmError::NotRunning {
                name: name.to_string(),
                state,
            }),
        }
    }

    /// Boot a stopped VM, or restore a saved one.
    pub fn start(&self, name: &str) -> Result<(), VmError> {
        match self.hv.domain_state(name)? {
            PowerState::Undefined => Err(VmError::DomainMissing {
                name: name.to_string(),
            }),
            PowerState::Stopped => {
                let project = self.registry.project(name);
                if !project.disk_path.exists() {
                    return Err(VmError::DiskMissing {
                        name: name.to_string(),
                        path: project.disk_path.display().to_string(),
                    });
                }
                tracing::info!(name, "starting");
                self.hv.start(name)
            }
            PowerState::Saved => self.start_from_save(name),
            state => Err(VmError::InvalidTransition {
                name: name.to_string(),
                op: "start",
                state,
            }),
        }
    }

    pub fn start_from_save(&self, name: &str) -> Result<(), VmError> {
        match self.hv.domain_state(name)? {
            PowerState::Saved => {
                tracing::info!(name, "restoring from managed save");
                self.hv.start_from_save(name)
            }
            PowerState::Undefined => Err(VmError::DomainMissing {
                name: name.to_string(),
            }),
            state => Err(VmError::InvalidTransition {
                name: name.to_string(),
                op: "restore",
                state,
            }),
        }
    }

    pub fn pause(&self, name: &str) -> Result<(), VmError> {
        match self.hv.domain_state(name)? {
            PowerState::Running => self.hv.suspend(name),
            state => Err(VmError::NotRunning {
                name: name.to_string(),
                state,
            }),
        }
    }

    pub fn resume(&self, name: &str) -> Result<(), VmError> {
        match self.hv.domain_state(name)? {
            PowerState::Paused => self.hv.resume(name),
            state => Err(VmError::NotPaused {
                name: name.to_string(),
                state,
            }),
        }
    }

    /// Save guest memory to disk and stop (libvirt managed save).
    pub fn hibernate(&self, name: &str) -> Result<(), VmError> {
        match self.hv.domain_state(name)? {
            PowerState::Running => {
                self.usb.ensure_detached(name)?;
                tracing::info!(name, "hibernating");
                self.hv.managed_save(name)
            }
            state => Err(VmError::NotRunning {
                name: name.to_string(),
                state,
            }),
        }
    }

    /// Pull the plug. Returns `false` when the VM was already stopped.
    ///
    /// A saved VM is stopped by discarding its managed-save image.
    pub fn force_stop(&self, name: &str) -> Result<bool, VmError> {
        match self.hv.domain_state(name)? {
            PowerState::Stopped => {
                tracing::debug!(name, "already stopped");
                Ok(false)
            }
            PowerState::Undefined => Err(VmError::DomainMissing {
                name: name.to_string(),
            }),
            PowerState::Saved => {
                self.hv.managed_save_remove(name)?;
                Ok(true)
            }
            PowerState::Running | PowerState::Paused => {
                self.usb.ensure_detached(name)?;
                tracing::info!(name, "forcing stop");
                self.hv.destroy(name)?;
                Ok(true)
            }
        }
    }

    /// ACPI shutdown, falling back to a forced stop when the guest ignores
    /// it. Returns `false` when the VM was already stopped.
    pub async fn shutdown(&self, name: &str) -> Result<bool, VmError> {
        match self.hv.domain_state(name)? {
            PowerState::Stopped => return Ok(false),
            PowerState::Undefined => {
                return Err(VmError::DomainMissing {
                    name: name.to_string(),
                });
            }
            PowerState::Running => {}
            state => {
                return Err(VmError::NotRunning {
                    name: name.to_string(),
                    state,
                });
            }
        }

        self.usb.ensure_detached(name)?;
        self.hv.shutdown(name)?;
        let stopped = self
            .wait_for_stop(name, self.timings.shutdown_timeout, |_| {})
            .await?;
        if !stopped {
            tracing::warn!(name, "guest ignored ACPI shutdown, forcing stop");
            self.hv.destroy(name)?;
        }
        Ok(true)
    }

    pub async fn restart(&self, name: &str) -> Result<(), VmError> {
        let state = self.hv.domain_state(name)?;
        if state != PowerState::Running {
            return Err(VmError::NotRunning {
                name: name.to_string(),
                state,
            });
        }
        self.shutdown(name).await?;
        self.start(name)
    }

    /// Destroy, undefine and remove everything the VM owns.
    pub fn delete(&self, name: &str, selector: &mut ActiveVm) -> Result<(), VmError> {
        let project = self.registry.project(name);
        let state = self.hv.domain_state(name)?;
        if state == PowerState::Undefined && !project.directory.exists() {
            return Err(VmError::DomainMissing {
                name: name.to_string(),
            });
        }
        self.teardown(&project)?;
        tracing::info!(name, "deleted");
        self.forget(name, selector)
    }

    /// Remove what an interrupted create left behind: a directory without
    /// a domain, a domain without a disk, or a domain without a directory.
    pub fn cleanup_zombie(&self, name: &str, selector: &mut ActiveVm) -> Result<(), VmError> {
        let project = self.registry.project(name);
        let state = self.hv.domain_state(name)?;
        let dir_exists = project.directory.exists();

        let stale = match (state, dir_exists) {
            (PowerState::Undefined, false) => {
                return Err(VmError::DomainMissing {
                    name: name.to_string(),
                });
            }
            (PowerState::Undefined, true) => true,
            (_, false) => true,
            (_, true) => !project.disk_path.exists(),
        };
        if !stale {
            return Err(VmError::Validation {
                message: format!("'{name}' is healthy; use delete to remove it"),
            });
        }

        self.teardown(&project)?;
        tracing::info!(name, "cleaned up zombie");
        self.forget(name, selector)
    }

    /// Move the selector off a removed VM, onto the next remaining one.
    fn forget(&self, name: &str, selector: &mut ActiveVm) -> Result<(), VmError> {
        if selector.name() != Some(name) {
            return Ok(());
        }
        match self.registry.resolve_active(&ActiveVm::none()) {
            Some(next) => {
                tracing::info!(removed = name, active = %next.name, "switched active VM");
                selector.select(&next.name);
            }
            None => selector.clear(),
        }
        self.registry.save_selector(selector)
    }

    fn teardown(&self, project: &VmProject) -> Result<(), VmError> {
        let name = project.name.as_str();
        let state = self.hv.domain_state(name)?;
        if state.is_active() {
            self.usb.ensure_detached(name)?;
            self.hv.destroy(name)?;
        }
        if state != PowerState::Undefined {
            self.hv.undefine(name)?;
        }
        if project.directory.exists() {
            std::fs::remove_dir_all(&project.directory).map_err(|source| VmError::Io {
                context: format!("removing {}", project.directory.display()),
                source,
            })?;
        }
        Ok(())
    }

    /// Build a new VM from `image` and boot it through installation.
    ///
    /// If anything already exists under `name`, `confirm` decides whether
    /// to wipe it. Declining yields `AlreadyExists`.
    pub async fn create(
        &self,
        name: &str,
        image: &ImagePreset,
        selector: &mut ActiveVm,
        confirm: impl FnOnce(&VmProject, Conflict) -> Result<bool, VmError>,
        progress: &mut StepProgress,
    ) -> Result<VmProject, VmError> {
        validate_vm_name(name)?;
        let size = self.config.disk_size()?;
        let project = self.registry.project(name);
        let p = &project;

        let conflict = self.registry.conflict(name)?;
        if conflict.any() {
            if !confirm(p, conflict)? {
                return Err(VmError::AlreadyExists {
                    name: name.to_string(),
                });
            }
            progress
                .run("Removing old instance", move |_| async move { self.teardown(p) })
                .await?;
        } else {
            progress.skip("No previous instance");
        }

        let share_dir = self.config.share_dir();
        let share_dir = share_dir.as_deref();
        progress
            .run("Preparing directories", move |_| async move {
                create_dir(&p.directory)?;
                if let Some(dir) = share_dir {
                    create_dir(dir)?;
                }
                Ok::<_, VmError>(())
            })
            .await?;

        let base = progress
            .run("Fetching base image", move |step| async move {
                step.set_done_label(format!("Base image ready ({})", image.label));
                self.provisioner.fetch_base_image(&image.url).await
            })
            .await?;
        let base = base.as_path();

        progress
            .run("Creating disk", move |_| async move {
                self.provisioner
                    .create_derived_disk(base, &p.disk_path, size)
                    .await
            })
            .await?;

        let packages = self.config.guest.packages();
        let seed = GuestSeed {
            hostname: name,
            user: &self.config.guest.user,
            password: &self.config.guest.password,
            packages: &packages,
            share_tag: share_dir.map(|_| self.config.share.tag.as_str()),
        };
        let seed = &seed;
        progress
            .run("Rendering guest config", move |_| async move {
                self.provisioner
                    .render_guest_config(seed, &p.seed_path)
                    .await
            })
            .await?;

        let share = share_dir.map(|dir| Share {
            dir,
            tag: &self.config.share.tag,
        });
        let xml = domain_xml::generate_domain_xml(self.config, p, share.as_ref());
        let xml = xml.as_str();
        progress
            .run("Defining domain", move |_| async move {
                std::fs::write(&p.domain_xml_path, xml).map_err(|source| VmError::Io {
                    context: format!("writing {}", p.domain_xml_path.display()),
                    source,
                })?;
                self.hv.define(name, xml)
            })
            .await?;

        // First boot installs packages and powers the guest off.
        progress
            .run("Installing guest (first boot)", move |step| async move {
                self.hv.start(name)?;
                let done = self
                    .wait_for_stop(name, self.timings.install_timeout, |_| {
                        tail_kernel_log(&p.log_path, &step)
                    })
                    .await?;
                if !done {
                    return Err(VmError::InstallTimeout {
                        name: name.to_string(),
                        timeout_s: self.timings.install_timeout.as_secs(),
                    });
                }
                step.set_done_label("Guest installed");
                Ok(())
            })
            .await?;

        progress
            .run("Starting VM", move |_| async move { self.hv.start(name) })
            .await?;

        selector.select(name);
        self.registry.save_selector(selector)?;
        tracing::info!(name, "created");
        Ok(project)
    }

    /// Poll until the domain is stopped. `false` on timeout.
    async fn wait_for_stop(
        &self,
        name: &str,
        timeout: Duration,
        mut on_poll: impl FnMut(PowerState),
    ) -> Result<bool, VmError> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.hv.domain_state(name)?;
            if state == PowerState::Stopped {
                return Ok(true);
            }
            on_poll(state);
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(self.timings.poll).await;
        }
    }
}

fn create_dir(path: &Path) -> Result<(), VmError> {
    std::fs::create_dir_all(path).map_err(|source| VmError::Io {
        context: format!("creating {}", path.display()),
        source,
    })
}

/// Mirror the newest kernel log line under the install spinner.
fn tail_kernel_log(path: &Path, step: &Step) {
    if let Some(line) = last_line(path) {
        step.log(&line);
    }
}

fn last_line(path: &Path) -> Option<String> {
    const TAIL_BYTES: u64 = 4096;
    let mut file = std::fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(TAIL_BYTES))).ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).ok()?;
    String::from_utf8_lossy(&buf)
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}
