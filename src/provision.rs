use std::path::{Path, PathBuf};

use crate::cloudinit::{self, GuestSeed};
use crate::error::VmError;
use crate::image;
use crate::overlay;
use crate::util::DiskSize;

/// Everything create needs besides the hypervisor: base images, disks and
/// the guest's first-boot configuration.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Provisioner {
    /// Local path of the base image, downloading into the cache if needed.
    async fn fetch_base_image(&self, url: &str) -> Result<PathBuf, VmError>;
    async fn create_derived_disk(
        &self,
        base: &Path,
        dest: &Path,
        size: DiskSize,
    ) -> Result<(), VmError>;
    async fn render_guest_config(&self, seed: &GuestSeed<'_>, dest: &Path) -> Result<(), VmError>;
}

/// Production provisioner: reqwest downloads, `qemu-img`, `cloud-localds`.
pub struct ShellProvisioner {
    cache_dir: PathBuf,
}

impl ShellProvisioner {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }
}

impl Provisioner for ShellProvisioner {
    async fn fetch_base_image(&self, url: &str) -> Result<PathBuf, VmError> {
        image::ensure_base_image(url, &self.cache_dir).await
    }

    async fn create_derived_disk(
        &self,
        base: &Path,
        dest: &Path,
        size: DiskSize,
    ) -> Result<(), VmError> {
        overlay::create_derived_disk(base, dest, size).await
    }

    async fn render_guest_config(&self, seed: &GuestSeed<'_>, dest: &Path) -> Result<(), VmError> {
        cloudinit::generate_seed_iso(dest, seed).await
    }
}
