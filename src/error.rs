use miette::Diagnostic;
use thiserror::Error;

use crate::hypervisor::PowerState;

#[derive(Debug, Error, Diagnostic)]
pub enum VmError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("VM '{name}' already exists")]
    #[diagnostic(help("confirm the overwrite to recreate it, or pick another name"))]
    AlreadyExists { name: String },

    #[error("VM '{name}' has no domain definition")]
    #[diagnostic(help("the directory is a leftover; run `kvmdev cleanup` and recreate the VM"))]
    DomainMissing { name: String },

    #[error("disk image for '{name}' is missing: {path}")]
    #[diagnostic(help("recreate the VM with `kvmdev create --reset`"))]
    DiskMissing { name: String, path: String },

    #[error("VM '{name}' is not running (state: {state})")]
    NotRunning { name: String, state: PowerState },

    #[error("VM '{name}' is not paused (state: {state})")]
    NotPaused { name: String, state: PowerState },

    #[error("cannot {op} VM '{name}' while it is {state}")]
    InvalidTransition {
        name: String,
        op: &'static str,
        state: PowerState,
    },

    #[error("USB device {device} is attached to '{owner}', not '{target}'")]
    #[diagnostic(help("detach it from the VM that owns it first"))]
    WrongOwner {
        device: String,
        owner: String,
        target: String,
    },

    #[error("USB device {device} not found on the host")]
    DeviceNotFound { device: String },

    #[error("hypervisor rejected {action} of USB device {device}: {message}")]
    DeviceBusy {
        device: String,
        action: &'static str,
        message: String,
    },

    #[error("VM '{vm}' still has USB passthrough devices attached: {}", .devices.join(", "))]
    #[diagnostic(help(
        "detach every passthrough device before powering the VM down; \
         yanking them during a guest reset can wedge the host USB controller"
    ))]
    PassthroughStillAttached { vm: String, devices: Vec<String> },

    #[error("guest '{name}' did not finish installation within {timeout_s}s")]
    #[diagnostic(help("check the kernel log with `kvmdev log`"))]
    InstallTimeout { name: String, timeout_s: u64 },

    #[error("no VM selected and none exist")]
    #[diagnostic(help("create one with `kvmdev create <name>`"))]
    NoActiveVm,

    #[error("{tool}: {message}")]
    ExternalToolFailure { tool: String, message: String },

    #[error("cancelled")]
    Cancelled,
}

impl VmError {
    /// Wraps an opaque failure from libvirt, qemu-img, cloud-localds and friends.
    pub fn external(tool: impl Into<String>, message: impl ToString) -> Self {
        VmError::ExternalToolFailure {
            tool: tool.into(),
            message: message.to_string(),
        }
    }
}
