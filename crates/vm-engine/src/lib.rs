mod config;
mod engine;
mod error;
mod events;
mod mac;

pub use config::{
    BootLoader, DiskConfig, DiskKind, MIN_MEMORY_BYTES, MachineConfig, NetworkAttachment,
    NetworkConfig, SerialPort, SerialRole, ShareConfig,
};
pub use engine::VmEngine;
pub use error::{EngineError, Result};
pub use events::{EngineDelegate, EngineEvent};
pub use mac::MacAddress;
