use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::VmError;
use crate::hypervisor::{Hypervisor, PowerState};
use crate::paths;
use crate::util::validate_vm_name;

/// One VM and the files it owns under `<vms_dir>/<name>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmProject {
    pub name: String,
    pub directory: PathBuf,
    pub disk_path: PathBuf,
    pub seed_path: PathBuf,
    /// Kernel log written by the file-backed serial port.
    pub log_path: PathBuf,
    /// Transcript of the interactive serial line.
    pub serial_log_path: PathBuf,
    pub domain_xml_path: PathBuf,
}

impl VmProject {
    pub fn new(name: &str, vms_dir: &Path) -> Self {
        let directory = vms_dir.join(name);
        Self {
            name: name.to_string(),
            disk_path: directory.join(format!("{name}.qcow2")),
            seed_path: directory.join(format!("{name}-seed.iso")),
            log_path: directory.join(format!("{name}-console.log")),
            serial_log_path: directory.join(format!("{name}-serial.log")),
            domain_xml_path: directory.join(format!("{name}.xml")),
            directory,
        }
    }

    pub fn console_target(&self) -> ConsoleTarget {
        ConsoleTarget {
            domain: self.name.clone(),
            serial_device: "serial0",
            kernel_log: self.log_path.clone(),
            serial_log: self.serial_log_path.clone(),
        }
    }
}

/// Where an operator connects to watch a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleTarget {
    pub domain: String,
    /// Device name `virsh console` attaches to.
    pub serial_device: &'static str,
    pub kernel_log: PathBuf,
    pub serial_log: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectHealth {
    /// Domain defined and disk image present.
    Healthy,
    /// Directory without a domain definition.
    Zombie,
    /// Domain defined but the disk never got created.
    Uninitialized,
    /// The hypervisor could not be asked.
    Unknown,
}

impl ProjectHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Zombie => "zombie",
            Self::Uninitialized => "uninitialized",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProjectHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub project: VmProject,
    pub health: ProjectHealth,
}

/// What already exists for a name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conflict {
    pub directory: bool,
    pub domain: bool,
}

impl Conflict {
    pub fn any(self) -> bool {
        self.directory || self.domain
    }
}

/// Which VM operations apply to when none is named.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveVm {
    name: Option<String>,
}

impl ActiveVm {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn select(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn clear(&mut self) {
        self.name = None;
    }
}

/// Directory-backed view of all VM projects.
pub struct Registry<'a, H: Hypervisor> {
    vms_dir: PathBuf,
    hv: &'a H,
}

impl<'a, H: Hypervisor> Registry<'a, H> {
    pub fn new(vms_dir: impl Into<PathBuf>, hv: &'a H) -> Self {
        Self {
            vms_dir: vms_dir.into(),
            hv,
        }
    }

    pub fn vms_dir(&self) -> &Path {
        &self.vms_dir
    }

    pub fn project(&self, name: &str) -> VmProject {
        VmProject::new(name, &self.vms_dir)
    }

    /// All projects, sorted by name. A missing tree is an empty registry.
    pub fn list_projects(&self) -> Vec<ProjectInfo> {
        let Ok(entries) = std::fs::read_dir(&self.vms_dir) else {
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.starts_with('.'))
            .filter(|n| {
                let ok = validate_vm_name(n).is_ok();
                if !ok {
                    tracing::debug!(name = %n, "skipping directory with invalid VM name");
                }
                ok
            })
            .collect();
        names.sort();

        let domains = match self.hv.list_domains() {
            Ok(d) => Some(d.into_iter().collect::<HashSet<_>>()),
            Err(e) => {
                tracing::warn!(error = %e, "hypervisor unavailable, project health unknown");
                None
            }
        };

        names
            .iter()
            .map(|name| {
                let project = self.project(name);
                let health = Self::classify(&project, domains.as_ref());
                ProjectInfo { project, health }
            })
            .collect()
    }

    fn classify(project: &VmProject, domains: Option<&HashSet<String>>) -> ProjectHealth {
        let Some(domains) = domains else {
            return ProjectHealth::Unknown;
        };
        match (domains.contains(&project.name), project.disk_path.exists()) {
            (false, _) => ProjectHealth::Zombie,
            (true, true) => ProjectHealth::Healthy,
            (true, false) => ProjectHealth::Uninitialized,
        }
    }

    pub fn health(&self, project: &VmProject) -> ProjectHealth {
        match self.hv.list_domains() {
            Ok(d) => Self::classify(project, Some(&d.into_iter().collect())),
            Err(e) => {
                tracing::warn!(error = %e, "hypervisor unavailable, project health unknown");
                ProjectHealth::Unknown
            }
        }
    }

    /// The selected project if it still exists, else the first one found.
    pub fn resolve_active(&self, selector: &ActiveVm) -> Option<VmProject> {
        if let Some(name) = selector.name()
            && validate_vm_name(name).is_ok()
        {
            let project = self.project(name);
            if project.directory.is_dir() {
                return Some(project);
            }
            tracing::debug!(name, "selected VM no longer exists");
        }
        self.list_projects().into_iter().next().map(|p| p.project)
    }

    /// Existing directory and/or domain for `name`. A domain with no
    /// directory counts too.
    pub fn conflict(&self, name: &str) -> Result<Conflict, VmError> {
        let project = self.project(name);
        Ok(Conflict {
            directory: project.directory.exists(),
            domain: self.hv.domain_state(name)? != PowerState::Undefined,
        })
    }

    pub fn load_selector(&self) -> ActiveVm {
        match std::fs::read_to_string(paths::active_file(&self.vms_dir)) {
            Ok(s) if !s.trim().is_empty() => ActiveVm::named(s.trim()),
            _ => ActiveVm::none(),
        }
    }

    pub fn save_selector(&self, selector: &ActiveVm) -> Result<(), VmError> {
        let path = paths::active_file(&self.vms_dir);
        match selector.name() {
            Some(name) => {
                std::fs::create_dir_all(&self.vms_dir).map_err(|source| VmError::Io {
                    context: format!("creating {}", self.vms_dir.display()),
                    source,
                })?;
                std::fs::write(&path, format!("{name}\n")).map_err(|source| VmError::Io {
                    context: format!("writing {}", path.display()),
                    source,
                })
            }
            None => match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(VmError::Io {
                    context: format!("removing {}", path.display()),
                    source,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;

    fn make_project(root: &Path, name: &str, with_disk: bool) -> VmProject {
        let project = VmProject::new(name, root);
        std::fs::create_dir_all(&project.directory).unwrap();
        if with_disk {
            std::fs::write(&project.disk_path, b"qcow").unwrap();
        }
        project
    }

    #[test]
    fn project_layout() {
        let p = VmProject::new("driver-dev-vm", Path::new("/vms"));
        assert_eq!(p.directory, PathBuf::from("/vms/driver-dev-vm"));
        assert_eq!(p.disk_path, PathBuf::from("/vms/driver-dev-vm/driver-dev-vm.qcow2"));
        assert_eq!(p.seed_path, PathBuf::from("/vms/driver-dev-vm/driver-dev-vm-seed.iso"));
        assert_eq!(p.log_path, PathBuf::from("/vms/driver-dev-vm/driver-dev-vm-console.log"));
        assert_eq!(p.domain_xml_path, PathBuf::from("/vms/driver-dev-vm/driver-dev-vm.xml"));
    }

    #[test]
    fn console_target_points_at_serial0() {
        let t = VmProject::new("a", Path::new("/vms")).console_target();
        assert_eq!(t.domain, "a");
        assert_eq!(t.serial_device, "serial0");
        assert_eq!(t.kernel_log, PathBuf::from("/vms/a/a-console.log"));
        assert_eq!(t.serial_log, PathBuf::from("/vms/a/a-serial.log"));
    }

    #[test]
    fn missing_tree_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FakeHypervisor::new();
        let reg = Registry::new(dir.path().join("nope"), &hv);
        assert!(reg.list_projects().is_empty());
        assert_eq!(reg.resolve_active(&ActiveVm::none()), None);
    }

    #[test]
    fn classifies_projects() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FakeHypervisor::new();
        make_project(dir.path(), "healthy", true);
        make_project(dir.path(), "zombie", true);
        make_project(dir.path(), "half", false);
        hv.insert_domain("healthy", PowerState::Stopped);
        hv.insert_domain("half", PowerState::Stopped);

        let reg = Registry::new(dir.path(), &hv);
        let listed: Vec<(String, ProjectHealth)> = reg
            .list_projects()
            .into_iter()
            .map(|i| (i.project.name, i.health))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("half".to_string(), ProjectHealth::Uninitialized),
                ("healthy".to_string(), ProjectHealth::Healthy),
                ("zombie".to_string(), ProjectHealth::Zombie),
            ]
        );
    }

    #[test]
    fn hidden_entries_and_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FakeHypervisor::new();
        make_project(dir.path(), "vm1", true);
        std::fs::create_dir_all(dir.path().join(".trash")).unwrap();
        std::fs::write(dir.path().join(".active"), "vm1\n").unwrap();
        std::fs::write(dir.path().join("kvmdev.log"), "").unwrap();

        let reg = Registry::new(dir.path(), &hv);
        let names: Vec<String> = reg
            .list_projects()
            .into_iter()
            .map(|i| i.project.name)
            .collect();
        assert_eq!(names, vec!["vm1"]);
    }

    #[test]
    fn hypervisor_failure_downgrades_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FakeHypervisor::new();
        make_project(dir.path(), "vm1", true);
        hv.fail_next("list_domains", "connection refused");

        let reg = Registry::new(dir.path(), &hv);
        let infos = reg.list_projects();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].health, ProjectHealth::Unknown);
    }

    #[test]
    fn resolve_active_prefers_selector_then_first() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FakeHypervisor::new();
        make_project(dir.path(), "alpha", true);
        make_project(dir.path(), "beta", true);
        let reg = Registry::new(dir.path(), &hv);

        let chosen = reg.resolve_active(&ActiveVm::named("beta")).unwrap();
        assert_eq!(chosen.name, "beta");

        let fallback = reg.resolve_active(&ActiveVm::named("gone")).unwrap();
        assert_eq!(fallback.name, "alpha");

        let first = reg.resolve_active(&ActiveVm::none()).unwrap();
        assert_eq!(first.name, "alpha");
    }

    #[test]
    fn conflict_sees_directory_and_stale_domain() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FakeHypervisor::new();
        make_project(dir.path(), "dironly", false);
        hv.insert_domain("domonly", PowerState::Stopped);
        let reg = Registry::new(dir.path(), &hv);

        assert_eq!(
            reg.conflict("dironly").unwrap(),
            Conflict { directory: true, domain: false }
        );
        assert_eq!(
            reg.conflict("domonly").unwrap(),
            Conflict { directory: false, domain: true }
        );
        assert!(!reg.conflict("fresh").unwrap().any());
    }

    #[test]
    fn selector_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let hv = FakeHypervisor::new();
        let reg = Registry::new(dir.path().join("vms"), &hv);

        assert_eq!(reg.load_selector(), ActiveVm::none());
        reg.save_selector(&ActiveVm::named("vm-a")).unwrap();
        assert_eq!(reg.load_selector().name(), Some("vm-a"));

        reg.save_selector(&ActiveVm::none()).unwrap();
        assert_eq!(reg.load_selector(), ActiveVm::none());
        // clearing twice is fine
        reg.save_selector(&ActiveVm::none()).unwrap();
    }
}
