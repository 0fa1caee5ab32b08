use std::path::Path;

use crate::error::VmError;
use crate::util::DiskSize;

/// Create a qcow2 disk backed by `base_image`, grown to `size`.
///
/// Any existing file at `disk_path` is replaced.
pub async fn create_derived_disk(
    base_image: &Path,
    disk_path: &Path,
    size: DiskSize,
) -> Result<(), VmError> {
    if let Some(parent) = disk_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VmError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    match tokio::fs::remove_file(disk_path).await {
        Ok(()) => tracing::debug!(path = %disk_path.display(), "removed old disk"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(VmError::Io {
                context: format!("removing old disk {}", disk_path.display()),
                source: e,
            });
        }
    }

    let output = tokio::process::Command::new("qemu-img")
        .args(["create", "-f", "qcow2", "-b"])
        .arg(base_image)
        .args(["-F", "qcow2"])
        .arg(disk_path)
        .arg(size.to_string())
        .output()
        .await
        .map_err(|e| VmError::Io {
            context: "running qemu-img".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(VmError::external(
            "qemu-img",
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }

    tracing::info!(path = %disk_path.display(), %size, "created derived disk");
    Ok(())
}
