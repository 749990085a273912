use std::path::PathBuf;
use std::time::Duration;

#[cfg(target_arch = "aarch64")]
const DEFAULT_BINARY: &str = "qemu-system-aarch64";
#[cfg(not(target_arch = "aarch64"))]
const DEFAULT_BINARY: &str = "qemu-system-x86_64";

#[cfg(target_arch = "aarch64")]
const DEFAULT_MACHINE_TYPE: &str = "virt";
#[cfg(not(target_arch = "aarch64"))]
const DEFAULT_MACHINE_TYPE: &str = "q35";

/// How long QEMU must stay alive after spawn before the run counts as started.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// QEMU system emulator, either a bare name looked up on `PATH` or a path.
    pub binary: PathBuf,
    /// Value for `-machine`.
    pub machine_type: String,
    /// A QEMU process that exits within this window failed to start; one that
    /// survives it is reported as started.
    pub startup_grace: Duration,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}
