use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::usb::UsbId;

#[derive(Parser, Debug)]
#[command(
    name = "kvmdev",
    version,
    about = "Operator console for KVM driver-development VMs"
)]
pub struct Cli {
    /// Path to config file (default: ./kvmdev.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding one subdirectory per VM (overrides config)
    #[arg(long, global = true)]
    pub vms_dir: Option<PathBuf>,

    /// Operate on this VM instead of the selected one
    #[arg(long, global = true)]
    pub vm: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Plain, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive menu (default)
    Menu,

    /// List VM projects with their state
    List,

    /// Show state, health and attached devices of the VM
    Status,

    /// Create a VM from a cloud image and boot it through installation
    Create {
        /// VM name (prompted for when omitted)
        name: Option<String>,

        /// Image preset label or substring of it
        #[arg(short, long)]
        image: Option<String>,

        /// Recreate without asking if the VM already exists
        #[arg(long)]
        reset: bool,
    },

    /// Boot the VM, or restore it from hibernation
    Start,

    /// Suspend vCPUs of a running VM
    Pause,

    /// Resume a paused VM
    Resume,

    /// Save memory to disk and stop
    Hibernate,

    /// ACPI shutdown, hard power-off after a timeout
    Shutdown,

    /// Shut down and boot again
    Restart,

    /// Hard power-off
    ForceStop,

    /// Destroy, undefine and remove the VM directory
    Delete {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Remove leftovers of an interrupted create
    Cleanup {
        /// VM name (defaults to the selected VM)
        name: Option<String>,
    },

    /// Select the VM later commands operate on
    Switch {
        /// VM name (prompted for when omitted)
        name: Option<String>,
    },

    /// USB passthrough
    Usb {
        #[command(subcommand)]
        action: UsbCommand,
    },

    /// Attach to the VM's serial console
    Console,

    /// Print the tail of a log file
    Log {
        /// Serial console log instead of the kernel log
        #[arg(long, conflicts_with = "tool")]
        serial: bool,

        /// kvmdev's own log
        #[arg(long)]
        tool: bool,

        /// Number of lines
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },

    /// List image presets and cached downloads
    Images {
        /// Filter presets by label or URL substring
        query: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum UsbCommand {
    /// Host devices and which VM owns each
    List,

    /// Attach a free device to the VM, or detach it if the VM owns it
    Toggle {
        /// Device id as vendor:product in hex, e.g. 1234:5678
        device: UsbId,
    },

    /// Detach every device passed through to the VM
    DetachAll,
}
