use std::path::Path;

use facet_value::{VArray, Value, value};

use crate::error::VmError;

/// Kernel command line for guests: VGA plus both serial lines. ttyS0 comes
/// last so it is `/dev/console` and gets the login prompt; ttyS1 is the
/// file-backed kernel log.
pub const GUEST_KERNEL_CMDLINE: &str =
    "console=tty1 console=ttyS1,115200 console=ttyS0,115200 net.ifnames=0 biosdevname=0";

/// Inputs for the first-boot guest configuration.
pub struct GuestSeed<'a> {
    pub hostname: &'a str,
    pub user: &'a str,
    pub password: &'a str,
    pub packages: &'a [String],
    /// virtiofs tag of the host share, mounted at `~/<tag>`.
    pub share_tag: Option<&'a str>,
}

pub fn build_meta_data(hostname: &str) -> String {
    format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n")
}

pub fn build_user_data(seed: &GuestSeed) -> Result<String, VmError> {
    let user = value!({
        "name": (seed.user),
        "plain_text_passwd": (seed.password),
        "lock_passwd": false,
        "groups": "users, admin",
        "shell": "/bin/bash",
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
    });

    let mut runcmd = VArray::new();
    runcmd.push(Value::from(
        format!(
            "sed -i 's/^GRUB_CMDLINE_LINUX_DEFAULT=.*/GRUB_CMDLINE_LINUX_DEFAULT=\"{GUEST_KERNEL_CMDLINE}\"/' /etc/default/grub"
        )
        .as_str(),
    ));
    runcmd.push(value!(["update-grub"]));

    let mut mounts = VArray::new();
    if let Some(tag) = seed.share_tag {
        let target = format!("/home/{}/{tag}", seed.user);
        runcmd.push(Value::from(VArray::from_iter([
            Value::from("mkdir"),
            Value::from("-p"),
            Value::from(target.as_str()),
        ])));
        runcmd.push(Value::from(VArray::from_iter([
            Value::from("chown"),
            Value::from(format!("{0}:{0}", seed.user).as_str()),
            Value::from(target.as_str()),
        ])));
        runcmd.push(value!(["mount", "-a"]));
        mounts.push(Value::from(VArray::from_iter([
            Value::from(tag),
            Value::from(target.as_str()),
            Value::from("virtiofs"),
            Value::from("defaults,nofail"),
            Value::from("0"),
            Value::from("0"),
        ])));
    }

    let packages = VArray::from_iter(seed.packages.iter().map(|p| Value::from(p.as_str())));

    let mut config = value!({
        "hostname": (seed.hostname),
        "manage_etc_hosts": true,
        "ssh_pwauth": true,
        "users": [user],
        "package_update": true,
        "packages": (Value::from(packages)),
        "runcmd": (Value::from(runcmd)),
        // The host waits for this poweroff before the second boot, which
        // picks up the new kernel command line and fstab.
        "power_state": {
            "mode": "poweroff",
            "message": "first boot provisioning complete",
            "timeout": 30,
            "condition": true,
        },
    });

    if !mounts.is_empty()
        && let Some(obj) = config.as_object_mut()
    {
        obj.insert("mounts", Value::from(mounts));
    }

    let yaml = facet_yaml::to_string(&config)
        .map_err(|e| VmError::external("cloud-init", format!("serializing user-data: {e}")))?;
    // cloud-init wants #cloud-config on the first line, not a document separator
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

/// Write user-data and meta-data next to `seed_path` and pack them into a
/// NoCloud seed image with `cloud-localds`.
pub async fn generate_seed_iso(seed_path: &Path, seed: &GuestSeed<'_>) -> Result<(), VmError> {
    let dir = seed_path.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| VmError::Io {
            context: format!("creating directory {}", dir.display()),
            source: e,
        })?;

    let user_data_path = dir.join("user-data");
    let meta_data_path = dir.join("meta-data");
    write_file(&user_data_path, &build_user_data(seed)?).await?;
    write_file(&meta_data_path, &build_meta_data(seed.hostname)).await?;

    let _ = tokio::fs::remove_file(seed_path).await;
    let output = tokio::process::Command::new("cloud-localds")
        .arg(seed_path)
        .arg(&user_data_path)
        .arg(&meta_data_path)
        .output()
        .await
        .map_err(|e| VmError::Io {
            context: "running cloud-localds (is cloud-image-utils installed?)".into(),
            source: e,
        })?;

    let _ = tokio::fs::remove_file(&user_data_path).await;
    let _ = tokio::fs::remove_file(&meta_data_path).await;

    if !output.status.success() {
        return Err(VmError::external(
            "cloud-localds",
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }

    tracing::info!(path = %seed_path.display(), "generated cloud-init seed");
    Ok(())
}

async fn write_file(path: &Path, contents: &str) -> Result<(), VmError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| VmError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })
}
