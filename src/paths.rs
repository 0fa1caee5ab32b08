use std::path::{Path, PathBuf};

/// Default VM tree: `~/.local/share/kvmdev/vms/`
pub fn default_vms_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kvmdev")
        .join("vms")
}

/// Base image cache directory: `~/.cache/kvmdev/images/`
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kvmdev")
        .join("images")
}

/// Host directory exported to guests: `~/driver_projects`
pub fn default_share_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("driver_projects")
}

/// File recording the active VM, inside the VM tree.
pub fn active_file(vms_dir: &Path) -> PathBuf {
    vms_dir.join(".active")
}

/// Log file written by the file tracing layer.
pub fn log_file(vms_dir: &Path) -> PathBuf {
    vms_dir.join("kvmdev.log")
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest),
        None => PathBuf::from(path),
    }
}
