use std::collections::HashSet;
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};
use crate::mac::MacAddress;

/// Smallest guest memory size accepted by [`MachineConfig::validate`].
pub const MIN_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskKind {
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub read_only: bool,
    pub kind: DiskKind,
}

impl DiskConfig {
    pub fn disk(path: PathBuf) -> Self {
        Self {
            path,
            read_only: false,
            kind: DiskKind::Disk,
        }
    }

    /// CD-ROM images are always attached read-only.
    pub fn cdrom(path: PathBuf) -> Self {
        Self {
            path,
            read_only: true,
            kind: DiskKind::Cdrom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkAttachment {
    Nat,
    /// Host bridge interface, by name.
    Bridge(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Engine picks an address when unset.
    pub mac: Option<MacAddress>,
    pub attachment: NetworkAttachment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootLoader {
    Linux {
        kernel: PathBuf,
        initrd: Option<PathBuf>,
        cmdline: Option<String>,
    },
    Efi {
        firmware: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareConfig {
    pub path: PathBuf,
    /// Mount tag the guest uses to find the share.
    pub tag: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialRole {
    /// Primary interactive console (`hvc0` in the guest).
    Console,
    /// Host-to-guest JSON control line (`hvc1` in the guest).
    Control,
}

impl SerialRole {
    pub fn name(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Control => "control",
        }
    }
}

impl fmt::Display for SerialRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A serial port bound to a host descriptor. The engine reads guest input
/// from and writes guest output to the same descriptor.
#[derive(Debug)]
pub struct SerialPort {
    pub role: SerialRole,
    pub fd: OwnedFd,
}

/// Declarative hardware description handed to a [`crate::VmEngine`].
#[derive(Debug)]
pub struct MachineConfig {
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub disks: Vec<DiskConfig>,
    pub networks: Vec<NetworkConfig>,
    pub boot_loader: BootLoader,
    pub shares: Vec<ShareConfig>,
    pub serial_ports: Vec<SerialPort>,
    pub entropy: bool,
    pub balloon: bool,
}

impl MachineConfig {
    pub fn memory_mib(&self) -> u64 {
        self.memory_bytes / (1024 * 1024)
    }

    /// Check the configuration for host-independent mistakes.
    ///
    /// Collects every failure and returns them in a single `InvalidConfig`
    /// error so the operator can fix them in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.cpu_count == 0 {
            errors.push("cpu count must be at least 1".to_string());
        }
        if self.memory_bytes < MIN_MEMORY_BYTES {
            errors.push(format!(
                "memory size {} bytes is below the minimum of {MIN_MEMORY_BYTES}",
                self.memory_bytes
            ));
        }

        for disk in &self.disks {
            let label = match disk.kind {
                DiskKind::Disk => "disk image",
                DiskKind::Cdrom => "cdrom image",
            };
            check_file_exists(&disk.path, label, &mut errors);
        }

        match &self.boot_loader {
            BootLoader::Linux {
                kernel,
                initrd,
                cmdline,
            } => {
                check_file_exists(kernel, "kernel", &mut errors);
                if let Some(initrd) = initrd {
                    check_file_exists(initrd, "initrd", &mut errors);
                }
                if cmdline.as_deref().is_some_and(|c| c.contains('\0')) {
                    errors.push("kernel command line contains a NUL byte".to_string());
                }
            }
            BootLoader::Efi { firmware } => {
                check_file_exists(firmware, "EFI firmware", &mut errors);
            }
        }

        let mut tags = HashSet::new();
        for share in &self.shares {
            if !share.path.is_dir() {
                errors.push(format!(
                    "shared directory not found: {}",
                    share.path.display()
                ));
            }
            if share.tag.is_empty() {
                errors.push(format!(
                    "share {} has an empty tag",
                    share.path.display()
                ));
            } else if !tags.insert(share.tag.as_str()) {
                errors.push(format!("duplicate share tag: {}", share.tag));
            }
        }

        let mut roles = HashSet::new();
        for port in &self.serial_ports {
            if !roles.insert(port.role) {
                errors.push(format!("duplicate {} serial port", port.role));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig(errors.join("; ")))
        }
    }
}

fn check_file_exists(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.is_file() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}
