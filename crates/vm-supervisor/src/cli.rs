use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::debug;
use vm_engine::{
    BootLoader, DiskConfig, MacAddress, MachineConfig, NetworkAttachment, NetworkConfig,
    ShareConfig,
};
use vm_engine_qemu::QemuConfig;

use crate::config::{BootConfig, HOME_SHARE_TAG};
use crate::error::{SupervisorError, SupervisorResult};
use crate::supervisor::RunOptions;

pub const DEFAULT_CPU_COUNT: u32 = 1;
pub const DEFAULT_MEMORY_MIB: u64 = 512;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BootLoaderKind {
    Linux,
    Efi,
}

#[derive(Debug, Parser)]
#[command(name = "vm-supervisor", version, about = "Boot and supervise a single virtual machine")]
pub struct Cli {
    /// JSON boot config (cpus, memory, share_home, mac, kernel, cmdline, initrd)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of virtual CPUs [default: 1]
    #[arg(long, short = 'c')]
    pub cpu_count: Option<u32>,

    /// Memory size; bare numbers are MiB, K/M/G/T suffixes are binary units [default: 512]
    #[arg(long, short = 'm', value_parser = parse_memory_size)]
    pub memory_size: Option<u64>,

    /// Disk image (repeatable)
    #[arg(long = "disk", short = 'd')]
    pub disks: Vec<PathBuf>,

    /// CD-ROM image, attached read-only (repeatable)
    #[arg(long = "cdrom")]
    pub cdroms: Vec<PathBuf>,

    /// Directory share as PATH[:TAG][:ro] (repeatable)
    #[arg(long = "share", short = 's', value_parser = parse_share)]
    pub shares: Vec<ShareConfig>,

    /// Network device as [MAC@]TARGET, TARGET is `nat` or a bridge interface (repeatable)
    #[arg(long = "network", short = 'n', value_parser = parse_network)]
    pub networks: Vec<NetworkConfig>,

    /// Attach a memory balloon device (default)
    #[arg(long, overrides_with = "no_balloon")]
    pub balloon: bool,

    /// Do not attach a memory balloon device
    #[arg(long, overrides_with = "balloon")]
    pub no_balloon: bool,

    #[arg(long, value_enum, default_value_t = BootLoaderKind::Linux)]
    pub boot_loader: BootLoaderKind,

    /// Kernel image for the linux boot loader
    #[arg(long, short = 'k')]
    pub kernel: Option<PathBuf>,

    /// Initial ramdisk for the linux boot loader
    #[arg(long, short = 'i')]
    pub initrd: Option<PathBuf>,

    /// Kernel command line
    #[arg(long, short = 'a')]
    pub cmdline: Option<String>,

    /// Firmware image for the efi boot loader
    #[arg(long)]
    pub firmware: Option<PathBuf>,

    /// Write the supervisor's process id here
    #[arg(long, short = 'p')]
    pub pidfile: Option<PathBuf>,

    /// Symlink to the console pty
    #[arg(long)]
    pub console_symlink: Option<PathBuf>,

    /// Symlink to the control pty
    #[arg(long)]
    pub control_symlink: Option<PathBuf>,

    /// Reserved, currently has no effect
    #[arg(long, short = 'e')]
    pub escape_sequence: Option<String>,

    /// QEMU system emulator to run
    #[arg(long)]
    pub qemu_binary: Option<PathBuf>,

    /// Log debug output
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// Resolved inputs for one supervised run.
#[derive(Debug)]
pub struct Launch {
    pub options: RunOptions,
    pub qemu: QemuConfig,
}

impl Cli {
    /// Merge the command line over `file` and fill in defaults.
    pub fn into_launch(self, file: BootConfig) -> SupervisorResult<Launch> {
        let cpu_count = self.cpu_count.or(file.cpus).unwrap_or(DEFAULT_CPU_COUNT);
        let memory_bytes = match self.memory_size {
            Some(bytes) => bytes,
            None => {
                let mib = file.memory.unwrap_or(DEFAULT_MEMORY_MIB);
                mib.checked_mul(MIB).ok_or_else(|| {
                    SupervisorError::Config(format!("memory size {mib} MiB is too large"))
                })?
            }
        };

        let boot_loader = match self.boot_loader {
            BootLoaderKind::Linux => BootLoader::Linux {
                kernel: self.kernel.or(file.kernel).ok_or_else(|| {
                    SupervisorError::Config("linux boot loader requires a kernel".into())
                })?,
                initrd: self.initrd.or(file.initrd),
                cmdline: self.cmdline.or(file.cmdline),
            },
            BootLoaderKind::Efi => BootLoader::Efi {
                firmware: self.firmware.ok_or_else(|| {
                    SupervisorError::Config("efi boot loader requires firmware".into())
                })?,
            },
        };

        let networks = if self.networks.is_empty() {
            let mac = file.mac.as_deref().map(str::parse::<MacAddress>).transpose()?;
            vec![NetworkConfig {
                mac,
                attachment: NetworkAttachment::Nat,
            }]
        } else {
            if file.mac.is_some() {
                debug!("config file mac ignored, --network given");
            }
            self.networks
        };

        let mut shares = self.shares;
        if file.share_home {
            let home = std::env::var_os("HOME").ok_or_else(|| {
                SupervisorError::Config("share_home is set but HOME is not".into())
            })?;
            shares.push(ShareConfig {
                path: PathBuf::from(home),
                tag: HOME_SHARE_TAG.to_string(),
                read_only: false,
            });
        }

        let disks = self
            .disks
            .into_iter()
            .map(DiskConfig::disk)
            .chain(self.cdroms.into_iter().map(DiskConfig::cdrom))
            .collect();

        let machine = MachineConfig {
            cpu_count,
            memory_bytes,
            disks,
            networks,
            boot_loader,
            shares,
            serial_ports: Vec::new(),
            entropy: true,
            balloon: !self.no_balloon,
        };

        let mut options = RunOptions::new(machine);
        options.pidfile = self.pidfile;
        options.console_symlink = self.console_symlink;
        options.control_symlink = self.control_symlink;
        options.escape_sequence = self.escape_sequence;

        let mut qemu = QemuConfig::default();
        if let Some(binary) = self.qemu_binary {
            qemu.binary = binary;
        }

        Ok(Launch { options, qemu })
    }
}

/// Parse a memory size into bytes. Bare numbers are MiB.
pub fn parse_memory_size(s: &str) -> Result<u64, String> {
    let invalid = || format!("invalid memory size: {s:?}");

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let shift = match unit.to_ascii_uppercase().as_str() {
        "K" => 10,
        "" | "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => return Err(invalid()),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("memory size {s:?} is too large"))
}

/// Parse `PATH[:TAG][:ro]`. Without a tag, the directory name is used.
pub fn parse_share(s: &str) -> Result<ShareConfig, String> {
    let mut parts: Vec<&str> = s.split(':').collect();
    let read_only = parts.len() > 1 && parts.last() == Some(&"ro");
    if read_only {
        parts.pop();
    }

    let (path, tag) = match parts.as_slice() {
        [path] => (*path, None),
        [path, tag] => (*path, Some(*tag)),
        _ => return Err(format!("invalid share {s:?}, expected PATH[:TAG][:ro]")),
    };
    if path.is_empty() {
        return Err(format!("invalid share {s:?}, path is empty"));
    }

    let path = PathBuf::from(path);
    let tag = match tag {
        Some(tag) => tag.to_string(),
        None => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| format!("cannot derive a tag for {s:?}, use PATH:TAG"))?,
    };
    Ok(ShareConfig {
        path,
        tag,
        read_only,
    })
}

/// Parse `[MAC@]TARGET` where TARGET is `nat` or a bridge interface name.
pub fn parse_network(s: &str) -> Result<NetworkConfig, String> {
    let (mac, target) = match s.split_once('@') {
        Some((mac, target)) => {
            let mac = mac.parse::<MacAddress>().map_err(|e| e.to_string())?;
            (Some(mac), target)
        }
        None => (None, s),
    };
    let attachment = match target {
        "" => return Err(format!("invalid network {s:?}, missing target")),
        "nat" => NetworkAttachment::Nat,
        bridge => NetworkAttachment::Bridge(bridge.to_string()),
    };
    Ok(NetworkConfig { mac, attachment })
}
