//! QEMU-backed [`vm_engine::VmEngine`].
//!
//! The hardware description is mapped onto a QEMU command line; serial
//! attachments are passed as inherited descriptors. Lifecycle events come
//! from watching the QEMU process.

mod args;
mod config;
mod engine;
mod prerequisites;
mod process;

pub use config::{DEFAULT_STARTUP_GRACE, QemuConfig};
pub use engine::QemuEngine;
pub use prerequisites::{check_prerequisites, kvm_available};
