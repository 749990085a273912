use std::ffi::{OsStr, OsString};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use vm_engine::{
    BootLoader, DiskKind, MacAddress, MachineConfig, NetworkAttachment, SerialRole,
};

use crate::config::QemuConfig;

/// Console first so the guest enumerates it as `hvc0`, control as `hvc1`.
const SERIAL_ORDER: [SerialRole; 2] = [SerialRole::Console, SerialRole::Control];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accel {
    /// Hardware acceleration with TCG fallback.
    Kvm,
    Tcg,
}

/// Build the QEMU command line for `machine`.
///
/// Serial ports are referenced through `-add-fd` fd sets, so their
/// descriptors must be inherited by the spawned process.
pub(crate) fn build_args(
    machine: &MachineConfig,
    config: &QemuConfig,
    accel: Accel,
) -> Vec<OsString> {
    let mut args = Args::default();

    let accel_opt = match accel {
        Accel::Kvm => "kvm:tcg",
        Accel::Tcg => "tcg",
    };
    args.push("-machine");
    args.push(format!("{},accel={accel_opt}", config.machine_type));
    args.push("-cpu");
    args.push(match accel {
        Accel::Kvm => "host",
        Accel::Tcg => "max",
    });
    args.push("-smp");
    args.push(machine.cpu_count.to_string());
    args.push("-m");
    args.push(format!("{}M", machine.memory_mib()));
    args.extend(["-nodefaults", "-no-user-config", "-display", "none", "-no-reboot"]);

    match &machine.boot_loader {
        BootLoader::Linux {
            kernel,
            initrd,
            cmdline,
        } => {
            args.push("-kernel");
            args.push(kernel.as_os_str());
            if let Some(initrd) = initrd {
                args.push("-initrd");
                args.push(initrd.as_os_str());
            }
            if let Some(cmdline) = cmdline {
                args.push("-append");
                args.push(cmdline.as_str());
            }
        }
        BootLoader::Efi { firmware } => {
            args.push("-bios");
            args.push(firmware.as_os_str());
        }
    }

    for disk in &machine.disks {
        let mut drive = option_with_path("file=", disk.path.as_os_str());
        match disk.kind {
            DiskKind::Disk => {
                drive.push(",if=virtio,format=raw");
                if disk.read_only {
                    drive.push(",readonly=on");
                }
            }
            DiskKind::Cdrom => drive.push(",media=cdrom,readonly=on"),
        }
        args.push("-drive");
        args.push(drive);
    }

    for (index, network) in machine.networks.iter().enumerate() {
        let id = format!("net{index}");
        let netdev = match &network.attachment {
            NetworkAttachment::Nat => format!("user,id={id}"),
            NetworkAttachment::Bridge(bridge) => format!("bridge,id={id},br={bridge}"),
        };
        let mac = network.mac.unwrap_or_else(MacAddress::random);
        args.push("-netdev");
        args.push(netdev);
        args.push("-device");
        args.push(format!("virtio-net-pci,netdev={id},mac={mac}"));
    }

    for share in &machine.shares {
        let mut virtfs = option_with_path("local,path=", share.path.as_os_str());
        virtfs.push(format!(
            ",mount_tag={},security_model=mapped-xattr",
            share.tag
        ));
        if share.read_only {
            virtfs.push(",readonly=on");
        }
        args.push("-virtfs");
        args.push(virtfs);
    }

    if machine.entropy {
        args.extend(["-device", "virtio-rng-pci"]);
    }
    if machine.balloon {
        args.extend(["-device", "virtio-balloon-pci"]);
    }

    if !machine.serial_ports.is_empty() {
        args.extend(["-device", "virtio-serial-pci"]);
    }
    let ordered = SERIAL_ORDER
        .iter()
        .filter_map(|role| machine.serial_ports.iter().find(|p| p.role == *role));
    for (index, port) in ordered.enumerate() {
        let set = index + 1;
        let name = port.role.name();
        args.push("-add-fd");
        args.push(format!(
            "fd={},set={set},opaque={name}",
            port.fd.as_raw_fd()
        ));
        args.push("-chardev");
        args.push(format!("serial,id={name},path=/dev/fdset/{set}"));
        args.push("-device");
        args.push(format!("virtconsole,chardev={name},name={name}"));
    }

    args.0
}

#[derive(Default)]
struct Args(Vec<OsString>);

impl Args {
    fn push(&mut self, arg: impl Into<OsString>) {
        self.0.push(arg.into());
    }

    fn extend<const N: usize>(&mut self, items: [&str; N]) {
        self.0.extend(items.iter().map(OsString::from));
    }
}

/// `key` followed by `path` with commas doubled, as QEMU option parsing requires.
fn option_with_path(key: &str, path: &OsStr) -> OsString {
    let mut bytes = key.as_bytes().to_vec();
    for &b in path.as_bytes() {
        bytes.push(b);
        if b == b',' {
            bytes.push(b',');
        }
    }
    OsString::from_vec(bytes)
}
