use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn kvmdev() -> assert_cmd::Command {
    cargo_bin_cmd!("kvmdev").into()
}

/// Config pointing at libvirt's built-in test driver and a private VMs dir.
fn write_test_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let config_path = dir.path().join("kvmdev.toml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(
        f,
        r#"
vms_dir = "{}"

[resources]
cpus = 2
memory_mb = 2048

[advanced]
libvirt_uri = "test:///default"
"#,
        dir.path().join("vms").display()
    )
    .unwrap();
    config_path
}

#[test]
fn help_works() {
    kvmdev()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("KVM driver-development VMs"))
        .stdout(predicate::str::contains("force-stop"));
}

#[test]
fn usb_help_lists_actions() {
    kvmdev()
        .args(["usb", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("toggle"))
        .stdout(predicate::str::contains("detach-all"));
}

#[test]
fn missing_config_shows_error() {
    kvmdev()
        .args(["--config", "/nonexistent/kvmdev.toml", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn validation_rejects_zero_cpus() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("kvmdev.toml");
    std::fs::write(&config_path, "[resources]\ncpus = 0\n").unwrap();

    kvmdev()
        .args(["--config", config_path.to_str().unwrap(), "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cpus must be at least 1"));
}

#[test]
fn validation_rejects_bad_disk_size() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("kvmdev.toml");
    std::fs::write(&config_path, "[resources]\ndisk = \"lots\"\n").unwrap();

    kvmdev()
        .args(["--config", config_path.to_str().unwrap(), "list"])
        .assert()
        .failure();
}

#[test]
fn list_empty_vms_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    kvmdev()
        .args(["--config", config_path.to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No VMs under"));
}

#[test]
fn list_json_is_array() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    kvmdev()
        .args(["--config", config_path.to_str().unwrap(), "--output", "json", "list"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("["));
}

#[test]
fn list_shows_leftover_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);
    std::fs::create_dir_all(dir.path().join("vms").join("half-built")).unwrap();

    kvmdev()
        .args(["--config", config_path.to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("half-built"));
}

#[test]
fn images_lists_presets() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    kvmdev()
        .args(["--config", config_path.to_str().unwrap(), "images"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ubuntu 24.04 LTS"))
        .stdout(predicate::str::contains("Debian 12"));
}

#[test]
fn images_filter_by_query() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    kvmdev()
        .args(["--config", config_path.to_str().unwrap(), "images", "debian"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Debian 12"))
        .stdout(predicate::str::contains("Ubuntu").not());
}

#[test]
fn menu_needs_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    kvmdev()
        .args(["--config", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("needs a terminal"));
}

#[test]
fn start_without_any_vm() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    kvmdev()
        .args(["--config", config_path.to_str().unwrap(), "start"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no VM selected"));
}

#[test]
fn invalid_vm_name_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    kvmdev()
        .args(["--config", config_path.to_str().unwrap(), "--vm", "../etc", "status"])
        .assert()
        .failure();
}

#[test]
fn bad_usb_id_rejected_by_parser() {
    kvmdev()
        .args(["usb", "toggle", "not-an-id"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("USB id must look like"));
}
