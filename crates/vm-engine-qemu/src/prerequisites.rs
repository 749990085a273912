use std::path::Path;

use vm_engine::{EngineError, MachineConfig, NetworkAttachment};

use crate::config::QemuConfig;

const KVM_DEVICE: &str = "/dev/kvm";

/// Verify that the host can run `machine` before any start attempt.
///
/// A missing QEMU binary is a `BackendNotAvailable` error. Unknown bridge
/// interfaces are collected into a single `InvalidConfig` error.
pub fn check_prerequisites(
    config: &QemuConfig,
    machine: &MachineConfig,
) -> Result<(), EngineError> {
    if which::which(&config.binary).is_err() {
        return Err(EngineError::BackendNotAvailable(format!(
            "QEMU binary not found: {}",
            config.binary.display()
        )));
    }

    let mut errors = Vec::new();
    for network in &machine.networks {
        if let NetworkAttachment::Bridge(name) = &network.attachment {
            check_interface(name, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidConfig(errors.join("; ")))
    }
}

fn check_interface(name: &str, errors: &mut Vec<String>) {
    if name.is_empty() {
        errors.push("bridge interface name is empty".to_string());
    } else if nix::net::if_::if_nametoindex(name).is_err() {
        errors.push(format!("bridge interface not found: {name}"));
    }
}

/// Whether `/dev/kvm` exists and can be opened read-write.
pub fn kvm_available() -> bool {
    let kvm = Path::new(KVM_DEVICE);
    kvm.exists()
        && std::fs::File::options()
            .read(true)
            .write(true)
            .open(kvm)
            .is_ok()
}
