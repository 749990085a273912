use std::path::Path;

use tracing::info;
use vm_engine::{SerialPort, SerialRole};

use crate::error::SupervisorResult;
use crate::pty::PtyPair;
use crate::registry::ResourceRegistry;

/// The guest's primary serial console.
///
/// The master side goes to the engine; users attach to the slave device,
/// optionally through a published symlink.
#[derive(Debug)]
pub struct ConsoleChannel {
    pty: PtyPair,
}

impl ConsoleChannel {
    /// Allocate the console pty and, if `symlink` is given, publish a link
    /// to its slave device. A failed symlink is logged and ignored.
    pub fn open(registry: &ResourceRegistry, symlink: Option<&Path>) -> SupervisorResult<Self> {
        let pty = PtyPair::open()?;
        info!(device = %pty.slave_path().display(), "console pty allocated");
        if let Some(link) = symlink {
            registry.publish_symlink(pty.slave_path(), link);
        }
        Ok(Self { pty })
    }

    pub fn slave_path(&self) -> &Path {
        self.pty.slave_path()
    }

    pub fn attachment(&self) -> SupervisorResult<SerialPort> {
        self.pty.attachment(SerialRole::Console)
    }
}
