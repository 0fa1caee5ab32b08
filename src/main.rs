use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;
use inquire::Confirm;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use kvmdev::cli::{Cli, Command, OutputFormat, UsbCommand};
use kvmdev::config::{self, Config, ImagePreset};
use kvmdev::error::VmError;
use kvmdev::hypervisor::libvirt::LibvirtHypervisor;
use kvmdev::hypervisor::{Hypervisor, Unavailable};
use kvmdev::image;
use kvmdev::lifecycle::{CREATE_STEPS, Controller};
use kvmdev::logging;
use kvmdev::menu::{self, Session};
use kvmdev::paths;
use kvmdev::progress::{OutputMode, StepProgress};
use kvmdev::provision::ShellProvisioner;
use kvmdev::registry::{ActiveVm, ProjectHealth};
use kvmdev::serial::{self, LogKind};
use kvmdev::usb::{Attachment, SysfsUsbHost};
use kvmdev::util::validate_vm_name;

const DEFAULT_VM_NAME: &str = "driver-dev-vm";

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let interactive = std::io::stdout().is_terminal() && std::io::stdin().is_terminal();
    let mode = resolve_output_mode(&cli.output, cli.verbose, interactive);

    let terminal_filter = if cli.verbose {
        EnvFilter::new("kvmdev=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kvmdev=warn"))
    };
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures kvmdev=debug, discards until the VMs
    // directory is known
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("kvmdev=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(dir) = &cli.vms_dir {
        config.vms_dir = dir.display().to_string();
    }
    let vms_dir = config.vms_dir();
    if let Err(e) = file_handle.set_file(&paths::log_file(&vms_dir)) {
        tracing::debug!(error = %e, "file logging disabled");
    }

    let command = cli.command.unwrap_or(Command::Menu);
    if matches!(command, Command::Menu) && !interactive {
        return Err(VmError::Validation {
            message: "the menu needs a terminal; see `kvmdev --help` for subcommands".into(),
        }
        .into());
    }
    tracing::debug!(?command, vms_dir = %vms_dir.display(), "starting");

    let cx = Context {
        config: &config,
        vms_dir,
        vm: cli.vm,
        format: cli.output,
        mode,
        interactive,
    };

    match LibvirtHypervisor::connect(&config.advanced.libvirt_uri) {
        Ok(hv) => dispatch(&hv, &cx, command).await?,
        // Read-only views still work without libvirt.
        Err(e) if matches!(command, Command::List | Command::Log { .. } | Command::Images { .. }) => {
            tracing::debug!(error = %e, "continuing without hypervisor");
            dispatch(&Unavailable::new(e), &cx, command).await?
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

struct Context<'c> {
    config: &'c Config,
    vms_dir: PathBuf,
    vm: Option<String>,
    format: OutputFormat,
    mode: OutputMode,
    interactive: bool,
}

impl Context<'_> {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }
}

async fn dispatch<H: Hypervisor>(hv: &H, cx: &Context<'_>, command: Command) -> Result<(), VmError> {
    let usb_host = SysfsUsbHost::new();
    let provisioner = ShellProvisioner::new(paths::cache_dir());
    let ctl = Controller::new(hv, &usb_host, &provisioner, cx.config);
    let mut selector = ctl.registry().load_selector();

    // Everything that acts on one VM goes through this.
    let target = |selector: &ActiveVm| -> Result<String, VmError> {
        if let Some(name) = &cx.vm {
            validate_vm_name(name)?;
            return Ok(name.clone());
        }
        ctl.active(&mut selector.clone())
    };

    match command {
        Command::Menu => {
            if let Ok(name) = target(&selector) {
                selector.select(&name);
            }
            let session = Session {
                libvirt_uri: &cx.config.advanced.libvirt_uri,
                mode: cx.mode,
            };
            menu::run(&ctl, &mut selector, &session).await?;
        }
        Command::List => {
            let active = ctl.registry().resolve_active(&selector).map(|p| p.name);
            let entries: Vec<ListEntryJson> = ctl
                .registry()
                .list_projects()
                .into_iter()
                .map(|info| {
                    let state = match info.health {
                        ProjectHealth::Unknown => "unknown".to_string(),
                        _ => hv
                            .domain_state(&info.project.name)
                            .map(|s| s.to_string())
                            .unwrap_or_else(|_| "unknown".to_string()),
                    };
                    ListEntryJson {
                        active: active.as_deref() == Some(info.project.name.as_str()),
                        name: info.project.name,
                        state,
                        health: info.health.to_string(),
                    }
                })
                .collect();

            if cx.json() {
                println!("{}", to_json(&entries)?);
            } else if entries.is_empty() {
                println!("No VMs under {}.", cx.vms_dir.display());
            } else {
                for e in &entries {
                    let marker = if e.active { "*" } else { " " };
                    println!("{marker} {:<24} {:<10} {}", e.name, e.state, e.health);
                }
            }
        }
        Command::Status => {
            let status = ctl.status(&target(&selector)?)?;
            let devices: Vec<String> = status.devices.iter().map(|d| d.id.to_string()).collect();
            if cx.json() {
                println!(
                    "{}",
                    to_json(&StatusJson {
                        name: status.project.name.clone(),
                        state: status.state.to_string(),
                        health: status.health.to_string(),
                        directory: status.project.directory.display().to_string(),
                        kernel_log: status.project.log_path.display().to_string(),
                        serial_log: status.project.serial_log_path.display().to_string(),
                        devices,
                    })?
                );
            } else {
                println!("VM '{}': {}", status.project.name, status.state);
                println!("  Health: {}", status.health);
                println!("  Directory: {}", status.project.directory.display());
                println!("  Kernel log: {}", status.project.log_path.display());
                println!("  Serial log: {}", status.project.serial_log_path.display());
                if devices.is_empty() {
                    println!("  USB: none attached");
                } else {
                    println!("  USB: {}", devices.join(", "));
                }
            }
        }
        Command::Create { name, image, reset } => {
            let name = match name {
                Some(n) => n,
                None if cx.interactive => menu::prompt_name("VM name:", DEFAULT_VM_NAME)?,
                None => {
                    return Err(VmError::Validation {
                        message: "a VM name is required when not on a terminal".into(),
                    });
                }
            };
            let preset = pick_preset(&cx.config.images, image.as_deref(), cx.interactive)?;
            let interactive = cx.interactive;
            let mut progress = StepProgress::new(CREATE_STEPS, cx.mode);
            let project = ctl
                .create(
                    &name,
                    preset,
                    &mut selector,
                    |project, conflict| {
                        if reset {
                            Ok(true)
                        } else if interactive {
                            menu::confirm_overwrite(project, conflict)
                        } else {
                            Ok(false)
                        }
                    },
                    &mut progress,
                )
                .await?;
            println!(
                "VM '{}' is running. Attach with `kvmdev console`.",
                project.name
            );
        }
        Command::Start => {
            let name = target(&selector)?;
            ctl.start(&name)?;
            println!("VM '{name}' started.");
        }
        Command::Pause => {
            let name = target(&selector)?;
            ctl.pause(&name)?;
            println!("VM '{name}' paused.");
        }
        Command::Resume => {
            let name = target(&selector)?;
            ctl.resume(&name)?;
            println!("VM '{name}' resumed.");
        }
        Command::Hibernate => {
            let name = target(&selector)?;
            ctl.hibernate(&name)?;
            println!("VM '{name}' hibernated.");
        }
        Command::Shutdown => {
            let name = target(&selector)?;
            if ctl.shutdown(&name).await? {
                println!("VM '{name}' shut down.");
            } else {
                println!("VM '{name}' is already stopped.");
            }
        }
        Command::Restart => {
            let name = target(&selector)?;
            ctl.restart(&name).await?;
            println!("VM '{name}' restarted.");
        }
        Command::ForceStop => {
            let name = target(&selector)?;
            if ctl.force_stop(&name)? {
                println!("VM '{name}' stopped.");
            } else {
                println!("VM '{name}' is already stopped.");
            }
        }
        Command::Delete { yes } => {
            let name = target(&selector)?;
            if !yes {
                if !cx.interactive {
                    return Err(VmError::Validation {
                        message: "pass --yes to delete without a terminal".into(),
                    });
                }
                let sure = Confirm::new(&format!("Delete '{name}' and everything in its directory?"))
                    .with_default(false)
                    .prompt()
                    .map_err(menu::map_inquire_err)?;
                if !sure {
                    println!("Cancelled.");
                    return Ok(());
                }
            }
            ctl.delete(&name, &mut selector)?;
            println!("VM '{name}' deleted.");
        }
        Command::Cleanup { name } => {
            let name = match name {
                Some(n) => {
                    validate_vm_name(&n)?;
                    n
                }
                None => target(&selector)?,
            };
            ctl.cleanup_zombie(&name, &mut selector)?;
            println!("Leftovers of '{name}' removed.");
        }
        Command::Switch { name } => {
            let name = match name {
                Some(n) => n,
                None if cx.interactive => menu::prompt_name("Switch to VM:", DEFAULT_VM_NAME)?,
                None => {
                    return Err(VmError::Validation {
                        message: "a VM name is required when not on a terminal".into(),
                    });
                }
            };
            ctl.switch(&name, &mut selector)?;
            println!("Active VM is now '{name}'.");
        }
        Command::Usb { action } => match action {
            UsbCommand::List => {
                let entries = ctl.usb().devices()?;
                if cx.json() {
                    let rows: Vec<UsbJson> = entries
                        .iter()
                        .map(|e| UsbJson {
                            id: e.device.id.to_string(),
                            name: e.device.name.clone(),
                            bus_address: e.device.bus_address.map(|a| a.to_string()),
                            attached_to: e.attachment.owner().map(String::from),
                        })
                        .collect();
                    println!("{}", to_json(&rows)?);
                } else if entries.is_empty() {
                    println!("No USB devices found.");
                } else {
                    for e in &entries {
                        println!("{:<22} {} {}", e.attachment.to_string(), e.device.id, e.device.name);
                    }
                }
            }
            UsbCommand::Toggle { device } => {
                let name = target(&selector)?;
                match ctl.usb().toggle_id(device, &name)? {
                    Attachment::Attached(vm) => println!("{device} attached to '{vm}'."),
                    Attachment::Free => println!("{device} detached from '{name}'."),
                }
            }
            UsbCommand::DetachAll => {
                let name = target(&selector)?;
                let n = ctl.usb().detach_all(&name)?;
                println!("Detached {n} device(s) from '{name}'.");
            }
        },
        Command::Console => {
            let console = ctl.console_target(&target(&selector)?)?;
            serial::attach(&cx.config.advanced.libvirt_uri, &console).await?;
        }
        Command::Log {
            serial: serial_log,
            tool,
            lines,
        } => {
            if tool {
                serial::print_tail(&paths::log_file(&cx.vms_dir), lines)?;
            } else {
                let kind = if serial_log {
                    LogKind::Serial
                } else {
                    LogKind::Kernel
                };
                let console = ctl.registry().project(&target(&selector)?).console_target();
                serial::print_tail(kind.path(&console), lines)?;
            }
        }
        Command::Images { query } => {
            let presets = image::filter_images(&cx.config.images, query.as_deref());
            let cached = image::list_cached(&paths::cache_dir())?;
            if cx.json() {
                let json = ImagesJson {
                    presets: presets
                        .iter()
                        .map(|p| PresetJson {
                            label: p.label.clone(),
                            url: p.url.clone(),
                            cached: image::is_cached(&p.url, &paths::cache_dir()),
                        })
                        .collect(),
                    cached: cached.iter().map(|c| c.file_name.clone()).collect(),
                };
                println!("{}", to_json(&json)?);
            } else {
                if presets.is_empty() {
                    println!("No image presets match.");
                }
                for p in &presets {
                    println!("{:<20} {}", p.label, p.url);
                }
                if !cached.is_empty() {
                    println!();
                    println!("Cached in {}:", paths::cache_dir().display());
                    for c in &cached {
                        println!("  {:<48} {}", c.file_name, image::format_size(c.size));
                    }
                }
            }
        }
    }
    Ok(())
}

/// `--image` matches by label or URL substring; otherwise prompt, or take
/// the first preset when there is no terminal.
fn pick_preset<'i>(
    images: &'i [ImagePreset],
    query: Option<&str>,
    interactive: bool,
) -> Result<&'i ImagePreset, VmError> {
    match query {
        Some(q) => image::filter_images(images, Some(q))
            .into_iter()
            .next()
            .ok_or_else(|| VmError::Validation {
                message: format!("no image preset matches '{q}' (see `kvmdev images`)"),
            }),
        None if interactive => menu::pick_image(images),
        None => images.first().ok_or_else(|| VmError::Validation {
            message: "no image presets configured".into(),
        }),
    }
}

fn to_json<'f, T: facet::Facet<'f>>(value: &T) -> Result<String, VmError> {
    facet_json::to_string(value).map_err(|e| VmError::external("json", e))
}

// ── JSON output structs ─────────────────────────────────────────────

#[derive(facet::Facet)]
struct ListEntryJson {
    name: String,
    state: String,
    health: String,
    active: bool,
}

#[derive(facet::Facet)]
struct StatusJson {
    name: String,
    state: String,
    health: String,
    directory: String,
    kernel_log: String,
    serial_log: String,
    devices: Vec<String>,
}

#[derive(facet::Facet)]
struct UsbJson {
    id: String,
    name: String,
    bus_address: Option<String>,
    attached_to: Option<String>,
}

#[derive(facet::Facet)]
struct PresetJson {
    label: String,
    url: String,
    cached: bool,
}

#[derive(facet::Facet)]
struct ImagesJson {
    presets: Vec<PresetJson>,
    cached: Vec<String>,
}

/// JSON keeps progress free of ANSI; so does a non-terminal stdout.
fn resolve_output_mode(format: &OutputFormat, verbose: bool, interactive: bool) -> OutputMode {
    match format {
        OutputFormat::Json => OutputMode::Plain,
        OutputFormat::Plain if !interactive => OutputMode::Plain,
        OutputFormat::Plain if verbose => OutputMode::Verbose,
        OutputFormat::Plain => OutputMode::Normal,
    }
}
