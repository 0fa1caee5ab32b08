//! Interactive operator menu.
//!
//! Each pass re-reads the selected VM's state for the header, so what is
//! shown always matches the hypervisor. A failed action prints one line and
//! returns to the menu.

use std::fmt;

use console::style;
use inquire::{Confirm, Select, Text};

use crate::config::ImagePreset;
use crate::error::VmError;
use crate::hypervisor::{Hypervisor, PowerState};
use crate::lifecycle::{CREATE_STEPS, Controller};
use crate::progress::{OutputMode, StepProgress};
use crate::provision::Provisioner;
use crate::registry::{ActiveVm, Conflict, ProjectHealth, VmProject};
use crate::serial::{self, LogKind};
use crate::usb::{Attachment, DeviceEntry, UsbHost};
use crate::util::validate_vm_name;

const DEFAULT_VM_NAME: &str = "driver-dev-vm";
const LOG_LINES: usize = 40;

/// Settings the menu needs besides the controller.
pub struct Session<'s> {
    pub libvirt_uri: &'s str,
    pub mode: OutputMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Pause,
    Hibernate,
    Shutdown,
    Restart,
    ForceStop,
    Usb,
    Console,
    KernelLog,
    Create,
    Switch,
    Delete,
    Cleanup,
    Quit,
}

impl Action {
    const ALL: [Action; 14] = [
        Action::Start,
        Action::Pause,
        Action::Hibernate,
        Action::Shutdown,
        Action::Restart,
        Action::ForceStop,
        Action::Usb,
        Action::Console,
        Action::KernelLog,
        Action::Create,
        Action::Switch,
        Action::Delete,
        Action::Cleanup,
        Action::Quit,
    ];
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Start => "Start / resume VM",
            Action::Pause => "Pause VM",
            Action::Hibernate => "Hibernate VM",
            Action::Shutdown => "Shut down VM",
            Action::Restart => "Restart VM",
            Action::ForceStop => "Force stop VM",
            Action::Usb => "USB manager",
            Action::Console => "Console (access VM)",
            Action::KernelLog => "Kernel log",
            Action::Create => "Create / reset VM",
            Action::Switch => "Switch active VM",
            Action::Delete => "Delete VM",
            Action::Cleanup => "Clean up leftovers",
            Action::Quit => "Quit",
        })
    }
}

pub fn map_inquire_err(e: inquire::InquireError) -> VmError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            VmError::Cancelled
        }
        other => VmError::Validation {
            message: format!("prompt error: {other}"),
        },
    }
}

/// Run the menu until the operator quits.
pub async fn run<H, U, P>(
    ctl: &Controller<'_, H, U, P>,
    selector: &mut ActiveVm,
    session: &Session<'_>,
) -> Result<(), VmError>
where
    H: Hypervisor,
    U: UsbHost,
    P: Provisioner,
{
    loop {
        // Follow a deleted or missing selection to a VM that exists.
        if let Err(e) = ctl.active(selector) {
            tracing::debug!(error = %e, "no active VM");
        }
        println!();
        println!("{}", header(ctl, selector));

        let action = match Select::new("Main menu", Action::ALL.to_vec())
            .with_page_size(Action::ALL.len())
            .prompt()
        {
            Ok(a) => a,
            Err(e) => match map_inquire_err(e) {
                VmError::Cancelled => return Ok(()),
                other => return Err(other),
            },
        };
        if action == Action::Quit {
            return Ok(());
        }

        match perform(ctl, selector, session, action).await {
            Ok(()) | Err(VmError::Cancelled) => {}
            Err(e) => {
                tracing::debug!(?action, error = %e, "menu action failed");
                println!("{} {e}", style("\u{2717}").red().bold());
            }
        }
    }
}

/// `KVMDEV | VM: name` plus the live state.
fn header<H: Hypervisor, U: UsbHost, P: Provisioner>(
    ctl: &Controller<'_, H, U, P>,
    selector: &ActiveVm,
) -> String {
    let Some(name) = selector.name() else {
        return format!(
            "{} {}",
            style(" KVMDEV | VM: (none) ").white().on_blue().bold(),
            style("create one to get started").dim()
        );
    };
    let state = match ctl.state(name) {
        Ok(PowerState::Undefined) => style("NOT FOUND".to_string()).red(),
        Ok(s @ PowerState::Running) => style(s.as_str().to_uppercase()).green(),
        Ok(s @ (PowerState::Paused | PowerState::Saved)) => {
            style(s.as_str().to_uppercase()).yellow()
        }
        Ok(s) => style(s.as_str().to_uppercase()).dim(),
        Err(_) => style("UNKNOWN".to_string()).red(),
    };
    format!(
        "{} Status: [{}]",
        style(format!(" KVMDEV | VM: {name} ")).white().on_blue().bold(),
        state.bold()
    )
}

fn done(message: impl fmt::Display) {
    println!("{} {message}", style("\u{2713}").green().bold());
}

async fn perform<H, U, P>(
    ctl: &Controller<'_, H, U, P>,
    selector: &mut ActiveVm,
    session: &Session<'_>,
    action: Action,
) -> Result<(), VmError>
where
    H: Hypervisor,
    U: UsbHost,
    P: Provisioner,
{
    match action {
        Action::Start => {
            let name = ctl.active(selector)?;
            if ctl.state(&name)? == PowerState::Paused {
                ctl.resume(&name)?;
                done(format!("'{name}' resumed"));
            } else {
                ctl.start(&name)?;
                done(format!("'{name}' started"));
            }
        }
        Action::Pause => {
            let name = ctl.active(selector)?;
            ctl.pause(&name)?;
            done(format!("'{name}' paused"));
        }
        Action::Hibernate => {
            let name = ctl.active(selector)?;
            ctl.hibernate(&name)?;
            done(format!("'{name}' hibernated"));
        }
        Action::Shutdown => {
            let name = ctl.active(selector)?;
            println!("Waiting for '{name}' to power off...");
            if ctl.shutdown(&name).await? {
                done(format!("'{name}' shut down"));
            } else {
                done(format!("'{name}' is already stopped"));
            }
        }
        Action::Restart => {
            let name = ctl.active(selector)?;
            println!("Restarting '{name}'...");
            ctl.restart(&name).await?;
            done(format!("'{name}' restarted"));
        }
        Action::ForceStop => {
            let name = ctl.active(selector)?;
            if ctl.force_stop(&name)? {
                done(format!("'{name}' stopped"));
            } else {
                done(format!("'{name}' is already stopped"));
            }
        }
        Action::Usb => usb_menu(ctl, &ctl.active(selector)?)?,
        Action::Console => {
            let target = ctl.console_target(&ctl.active(selector)?)?;
            serial::attach(session.libvirt_uri, &target).await?;
        }
        Action::KernelLog => {
            let name = ctl.active(selector)?;
            let target = ctl.registry().project(&name).console_target();
            serial::print_tail(LogKind::Kernel.path(&target), LOG_LINES)?;
        }
        Action::Create => {
            let images = &ctl.config().images;
            let image = pick_image(images)?;
            let default = selector.name().unwrap_or(DEFAULT_VM_NAME).to_string();
            let name = prompt_name("VM name:", &default)?;
            let mut progress = StepProgress::new(CREATE_STEPS, session.mode);
            let project = ctl
                .create(&name, image, selector, confirm_overwrite, &mut progress)
                .await?;
            done(format!("'{}' is up and selected", project.name));
        }
        Action::Switch => switch(ctl, selector)?,
        Action::Delete => {
            let name = ctl.active(selector)?;
            let sure = Confirm::new(&format!("Delete '{name}' and everything in its directory?"))
                .with_default(false)
                .prompt()
                .map_err(map_inquire_err)?;
            if sure {
                ctl.delete(&name, selector)?;
                done(format!("'{name}' deleted"));
            }
        }
        Action::Cleanup => {
            let broken: Vec<String> = ctl
                .registry()
                .list_projects()
                .into_iter()
                .filter(|p| p.health != ProjectHealth::Healthy)
                .map(|p| p.project.name)
                .collect();
            if broken.is_empty() {
                println!("Nothing to clean up.");
                return Ok(());
            }
            let name = Select::new("Clean up which VM?", broken)
                .prompt()
                .map_err(map_inquire_err)?;
            ctl.cleanup_zombie(&name, selector)?;
            done(format!("'{name}' cleaned up"));
        }
        Action::Quit => {}
    }
    Ok(())
}

/// Ask before wiping what already exists under a name.
pub fn confirm_overwrite(project: &VmProject, conflict: Conflict) -> Result<bool, VmError> {
    Confirm::new(&format!(
        "'{}' already exists ({}). Wipe it and recreate?",
        project.name,
        describe_conflict(conflict)
    ))
    .with_default(false)
    .prompt()
    .map_err(map_inquire_err)
}

pub fn describe_conflict(conflict: Conflict) -> &'static str {
    match (conflict.directory, conflict.domain) {
        (true, true) => "directory and domain",
        (true, false) => "directory only",
        (false, true) => "domain only",
        (false, false) => "nothing",
    }
}

pub fn pick_image(images: &[ImagePreset]) -> Result<&ImagePreset, VmError> {
    let labels: Vec<&str> = images.iter().map(|i| i.label.as_str()).collect();
    let label = Select::new("Select OS image", labels)
        .prompt()
        .map_err(map_inquire_err)?;
    images
        .iter()
        .find(|i| i.label == label)
        .ok_or_else(|| VmError::Validation {
            message: format!("unknown image '{label}'"),
        })
}

pub fn prompt_name(message: &str, default: &str) -> Result<String, VmError> {
    let name = Text::new(message)
        .with_default(default)
        .with_validator(|input: &str| {
            Ok(match validate_vm_name(input) {
                Ok(()) => inquire::validator::Validation::Valid,
                Err(e) => inquire::validator::Validation::Invalid(e.to_string().into()),
            })
        })
        .prompt()
        .map_err(map_inquire_err)?;
    Ok(name.trim().to_string())
}

fn switch<H: Hypervisor, U: UsbHost, P: Provisioner>(
    ctl: &Controller<'_, H, U, P>,
    selector: &mut ActiveVm,
) -> Result<(), VmError> {
    const OTHER: &str = "Other...";
    let mut names: Vec<String> = ctl
        .registry()
        .list_projects()
        .into_iter()
        .map(|p| p.project.name)
        .collect();
    names.push(OTHER.to_string());

    let picked = Select::new("Switch to", names)
        .prompt()
        .map_err(map_inquire_err)?;
    let name = if picked == OTHER {
        prompt_name("VM name:", DEFAULT_VM_NAME)?
    } else {
        picked
    };
    ctl.switch(&name, selector)?;
    done(format!("active VM is now '{name}'"));
    Ok(())
}

enum UsbChoice {
    Device(DeviceEntry),
    DetachAll,
    Back,
}

impl fmt::Display for UsbChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbChoice::Device(entry) => f.write_str(&device_line(entry)),
            UsbChoice::DetachAll => f.write_str("Detach all from this VM"),
            UsbChoice::Back => f.write_str("Back"),
        }
    }
}

fn device_line(entry: &DeviceEntry) -> String {
    let status = match &entry.attachment {
        Attachment::Free => "[   FREE   ]".to_string(),
        Attachment::Attached(vm) => format!("[ ATTACHED ] ({vm})"),
    };
    let name: String = entry.device.name.chars().take(40).collect();
    format!("{status} {} - {name}", entry.device.id)
}

/// Device list re-read after every toggle.
fn usb_menu<H: Hypervisor, U: UsbHost, P: Provisioner>(
    ctl: &Controller<'_, H, U, P>,
    vm: &str,
) -> Result<(), VmError> {
    loop {
        let mut choices: Vec<UsbChoice> = ctl
            .usb()
            .devices()?
            .into_iter()
            .map(UsbChoice::Device)
            .collect();
        if choices.is_empty() {
            println!("No USB devices found.");
        }
        choices.push(UsbChoice::DetachAll);
        choices.push(UsbChoice::Back);

        let choice = match Select::new(&format!("USB devices (target: {vm})"), choices).prompt() {
            Ok(c) => c,
            Err(e) => match map_inquire_err(e) {
                VmError::Cancelled => return Ok(()),
                other => return Err(other),
            },
        };

        let result = match choice {
            UsbChoice::Back => return Ok(()),
            UsbChoice::DetachAll => ctl
                .usb()
                .detach_all(vm)
                .map(|n| done(format!("detached {n} device(s)"))),
            UsbChoice::Device(entry) => ctl.usb().toggle(&entry.device, vm).map(|a| match a {
                Attachment::Free => done(format!("{} detached", entry.device.id)),
                Attachment::Attached(_) => done(format!("{} attached", entry.device.id)),
            }),
        };
        if let Err(e) = result {
            println!("{} {e}", style("\u{2717}").red().bold());
        }
    }
}
