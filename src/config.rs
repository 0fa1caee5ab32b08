use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::VmError;
use crate::paths;
use crate::util::DiskSize;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "kvmdev.toml";

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Config {
    /// Root of the per-VM directory tree. Empty means the platform default.
    #[facet(default)]
    pub vms_dir: String,
    #[facet(default)]
    pub resources: ResourcesConfig,
    #[facet(default)]
    pub guest: GuestConfig,
    #[facet(default)]
    pub share: ShareConfig,
    #[facet(default)]
    pub advanced: AdvancedConfig,
    #[facet(default)]
    pub install: InstallConfig,
    #[facet(default)]
    pub images: Vec<ImagePreset>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vms_dir: String::new(),
            resources: ResourcesConfig::default(),
            guest: GuestConfig::default(),
            share: ShareConfig::default(),
            advanced: AdvancedConfig::default(),
            install: InstallConfig::default(),
            images: builtin_images(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ResourcesConfig {
    #[facet(default = 4)]
    pub cpus: u32,
    #[facet(default = 4096)]
    pub memory_mb: u64,
    #[facet(default = "20G")]
    pub disk: String,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            memory_mb: 4096,
            disk: "20G".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct GuestConfig {
    #[facet(default = "ubuntu")]
    pub user: String,
    #[facet(default = "password")]
    pub password: String,
    /// Extra guest packages; unset means the driver-development set.
    pub packages: Option<Vec<String>>,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".into(),
            password: "password".into(),
            packages: None,
        }
    }
}

impl GuestConfig {
    pub fn packages(&self) -> Vec<String> {
        self.packages.clone().unwrap_or_else(default_packages)
    }
}

fn default_packages() -> Vec<String> {
    [
        "build-essential",
        "linux-headers-generic",
        "bear",
        "net-tools",
        "nfs-common",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ShareConfig {
    #[facet(default = true)]
    pub enabled: bool,
    /// Host directory; empty means `~/driver_projects`.
    #[facet(default)]
    pub dir: String,
    #[facet(default = "host_share")]
    pub tag: String,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: String::new(),
            tag: "host_share".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct AdvancedConfig {
    #[facet(default = "qemu:///system")]
    pub libvirt_uri: String,
    #[facet(default = "kvm")]
    pub domain_type: String,
    #[facet(default = "q35")]
    pub machine: String,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            libvirt_uri: "qemu:///system".into(),
            domain_type: "kvm".into(),
            machine: "q35".into(),
        }
    }
}

/// Timing of the first-boot install wait.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct InstallConfig {
    #[facet(default = 900)]
    pub timeout_s: u64,
    #[facet(default = 2000)]
    pub poll_ms: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            timeout_s: 900,
            poll_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct ImagePreset {
    pub label: String,
    pub url: String,
    #[facet(default)]
    pub variant: String,
}

impl ImagePreset {
    fn new(label: &str, url: &str, variant: &str) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            variant: variant.into(),
        }
    }
}

pub fn builtin_images() -> Vec<ImagePreset> {
    vec![
        ImagePreset::new(
            "Ubuntu 24.04 LTS",
            "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
            "ubuntu24.04",
        ),
        ImagePreset::new(
            "Ubuntu 22.04 LTS",
            "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img",
            "ubuntu22.04",
        ),
        ImagePreset::new(
            "Debian 12",
            "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
            "debian12",
        ),
    ]
}

impl Config {
    pub fn vms_dir(&self) -> PathBuf {
        if self.vms_dir.is_empty() {
            paths::default_vms_dir()
        } else {
            paths::expand_home(&self.vms_dir)
        }
    }

    /// Host directory to export, or `None` when sharing is disabled.
    pub fn share_dir(&self) -> Option<PathBuf> {
        if !self.share.enabled {
            return None;
        }
        Some(if self.share.dir.is_empty() {
            paths::default_share_dir()
        } else {
            paths::expand_home(&self.share.dir)
        })
    }

    pub fn disk_size(&self) -> Result<DiskSize, VmError> {
        self.resources.disk.parse()
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), VmError> {
    if config.resources.cpus < 1 {
        return Err(VmError::Validation {
            message: "cpus must be at least 1".into(),
        });
    }
    if config.resources.memory_mb < 256 {
        return Err(VmError::Validation {
            message: "memory_mb must be at least 256".into(),
        });
    }
    config.disk_size()?;

    let user = &config.guest.user;
    if user.is_empty()
        || !user
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(VmError::Validation {
            message: format!("guest user must be a lowercase login name (got '{user}')"),
        });
    }
    if config.guest.password.is_empty() {
        return Err(VmError::Validation {
            message: "guest password cannot be empty".into(),
        });
    }

    if config.share.enabled && config.share.tag.is_empty() {
        return Err(VmError::Validation {
            message: "share tag cannot be empty".into(),
        });
    }

    if config.install.timeout_s == 0 || config.install.poll_ms == 0 {
        return Err(VmError::Validation {
            message: "install timeout_s and poll_ms must be positive".into(),
        });
    }

    for (idx, image) in config.images.iter().enumerate() {
        if image.label.is_empty() || image.url.is_empty() {
            return Err(VmError::Validation {
                message: format!("images[{idx}]: label and url are required"),
            });
        }
    }

    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load the config file.
///
/// An explicit path must exist. Without one, `kvmdev.toml` in the working
/// directory is used if present, otherwise built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, VmError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !candidate.exists() {
                tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
                return Ok(Config::default());
            }
            candidate
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|source| VmError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    let config = parse_config(&path, &contents)?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

fn parse_config(path: &Path, contents: &str) -> Result<Config, VmError> {
    let mut config: Config = facet_toml::from_str(contents).map_err(|e| VmError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if config.images.is_empty() {
        config.images = builtin_images();
    }
    validate_config(&config)?;
    Ok(config)
}
