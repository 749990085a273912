//! Host-to-guest control line.
//!
//! A second pty carries newline-delimited JSON objects to the guest. The
//! engine holds the master, so the supervisor writes into the slave like any
//! other host-side client would. Writes are best effort: a message that
//! cannot be written in one non-blocking `write` is dropped.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use serde::Serialize;
use tracing::{debug, info, warn};
use vm_engine::{SerialPort, SerialRole};

use crate::error::{SupervisorError, SupervisorResult, nonfatal};
use crate::pty::PtyPair;
use crate::registry::ResourceRegistry;

/// Terminates every message on the wire.
pub const MESSAGE_DELIMITER: &[u8] = b"\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TimeUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlMessage {
    pub message_type: MessageType,
    /// Unix epoch seconds.
    pub time: i64,
}

impl ControlMessage {
    pub fn time_update(time: i64) -> Self {
        Self {
            message_type: MessageType::TimeUpdate,
            time,
        }
    }

    /// A `time_update` carrying the current host time.
    pub fn time_update_now() -> Self {
        Self::time_update(chrono::Utc::now().timestamp())
    }

    /// The message as one JSON object followed by [`MESSAGE_DELIMITER`].
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.extend_from_slice(MESSAGE_DELIMITER);
        Ok(line)
    }
}

#[derive(Debug)]
pub struct ControlChannel {
    pty: PtyPair,
    /// Non-blocking handle on the slave; `None` once closed.
    writer: Mutex<Option<File>>,
}

impl ControlChannel {
    /// Allocate the control pty and, if `symlink` is given, publish a link
    /// to its slave device. A failed symlink is logged and ignored.
    pub fn open(registry: &ResourceRegistry, symlink: Option<&Path>) -> SupervisorResult<Self> {
        let pty = PtyPair::open()?;
        let writer = pty
            .slave()
            .try_clone()
            .map_err(|e| SupervisorError::PtyAllocation(format!("dup control slave: {e}")))?;
        fcntl(&writer, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(|e| {
            SupervisorError::PtyAllocation(format!("set control slave non-blocking: {e}"))
        })?;
        info!(device = %pty.slave_path().display(), "control pty allocated");

        if let Some(link) = symlink {
            registry.publish_symlink(pty.slave_path(), link);
        }
        Ok(Self {
            pty,
            writer: Mutex::new(Some(File::from(writer))),
        })
    }

    pub fn slave_path(&self) -> &Path {
        self.pty.slave_path()
    }

    pub fn attachment(&self) -> SupervisorResult<SerialPort> {
        self.pty.attachment(SerialRole::Control)
    }

    /// Write `message` in a single write. Never fails from the caller's
    /// point of view; returns whether the whole line was written.
    pub fn send(&self, message: &ControlMessage) -> bool {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "serialize control message failed (ignored)");
                return false;
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(file) = writer.as_mut() else {
            debug!("control channel closed, message dropped");
            return false;
        };

        match nonfatal("write control message", file.write(&line)) {
            Some(n) if n == line.len() => {
                debug!(?message, "control message sent");
                true
            }
            Some(n) => {
                let short = io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write: {n} of {} bytes", line.len()),
                );
                nonfatal::<()>("write control message", Err(short));
                false
            }
            None => false,
        }
    }

    /// Stop accepting messages. Later `send` calls are no-ops.
    pub fn close(&self) {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
