use std::path::Path;
use std::process::Stdio;

use crate::error::VmError;
use crate::logging;
use crate::registry::ConsoleTarget;

/// Which log `log` prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Kernel messages from the file-backed serial port.
    Kernel,
    /// Transcript of the interactive serial line.
    Serial,
}

impl LogKind {
    pub fn path<'t>(&self, target: &'t ConsoleTarget) -> &'t Path {
        match self {
            LogKind::Kernel => &target.kernel_log,
            LogKind::Serial => &target.serial_log,
        }
    }
}

/// `virsh console` arguments for `target`.
pub fn virsh_args<'t>(uri: &'t str, target: &'t ConsoleTarget) -> [&'t str; 5] {
    ["-c", uri, "console", &target.domain, target.serial_device]
}

/// Hand the terminal to `virsh console` until the operator detaches.
pub async fn attach(uri: &str, target: &ConsoleTarget) -> Result<(), VmError> {
    println!("Attaching console to '{}' (press Ctrl+] to detach)...", target.domain);
    let mut child = tokio::process::Command::new("virsh")
        .args(virsh_args(uri, target))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| VmError::Io {
            context: "running virsh console".into(),
            source: e,
        })?;

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(s) if !s.success() => {
                    tracing::warn!(domain = %target.domain, "virsh console exited with {s}");
                }
                Err(e) => {
                    tracing::warn!(domain = %target.domain, "virsh console wait failed: {e}");
                }
                _ => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let _ = child.kill().await;
        }
    }
    println!("\nDetached from console. VM is still running.");
    Ok(())
}

/// Print the last `lines` lines of `path`, or a note when it is empty.
pub fn print_tail(path: &Path, lines: usize) -> Result<(), VmError> {
    let tail = logging::tail_lines(path, lines).map_err(|e| VmError::Io {
        context: format!("reading {}", path.display()),
        source: e,
    })?;
    if tail.is_empty() {
        println!("(no output yet in {})", path.display());
    }
    for line in tail {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::VmProject;

    #[test]
    fn virsh_targets_interactive_serial() {
        let target = VmProject::new("vm-a", Path::new("/vms")).console_target();
        assert_eq!(
            virsh_args("qemu:///system", &target),
            ["-c", "qemu:///system", "console", "vm-a", "serial0"]
        );
    }

    #[test]
    fn log_kind_picks_file() {
        let target = VmProject::new("vm-a", Path::new("/vms")).console_target();
        assert_eq!(
            LogKind::Kernel.path(&target),
            Path::new("/vms/vm-a/vm-a-console.log")
        );
        assert_eq!(
            LogKind::Serial.path(&target),
            Path::new("/vms/vm-a/vm-a-serial.log")
        );
    }
}
