use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use nix::pty::openpty;
use nix::sys::termios::{SetArg, cfmakeraw, tcgetattr, tcsetattr};
use vm_engine::{SerialPort, SerialRole};

use crate::error::{SupervisorError, SupervisorResult};

/// A pseudo-terminal pair in raw mode.
///
/// The slave side stays open for the life of the pair so the device node
/// persists and guest output is buffered even before anyone attaches.
/// Bytes written to the slave come out of the master, and the reverse.
#[derive(Debug)]
pub struct PtyPair {
    master: OwnedFd,
    slave: OwnedFd,
    slave_path: PathBuf,
}

impl PtyPair {
    pub fn open() -> SupervisorResult<Self> {
        let pty = openpty(None, None)
            .map_err(|e| SupervisorError::PtyAllocation(format!("openpty: {e}")))?;

        let mut termios = tcgetattr(&pty.slave)
            .map_err(|e| SupervisorError::PtyAllocation(format!("tcgetattr: {e}")))?;
        cfmakeraw(&mut termios);
        tcsetattr(&pty.slave, SetArg::TCSANOW, &termios)
            .map_err(|e| SupervisorError::PtyAllocation(format!("tcsetattr: {e}")))?;

        let slave_path = nix::unistd::ttyname(&pty.slave)
            .map_err(|e| SupervisorError::PtyAllocation(format!("ttyname: {e}")))?;

        Ok(Self {
            master: pty.master,
            slave: pty.slave,
            slave_path,
        })
    }

    /// Device path of the slave side, e.g. `/dev/pts/3`.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    pub fn master(&self) -> &OwnedFd {
        &self.master
    }

    /// The host end. Whatever is written here is read by the engine.
    pub fn slave(&self) -> &OwnedFd {
        &self.slave
    }

    /// A serial attachment backed by a duplicate of the master descriptor.
    pub fn attachment(&self, role: SerialRole) -> SupervisorResult<SerialPort> {
        let fd = self
            .master
            .try_clone()
            .map_err(|e| SupervisorError::PtyAllocation(format!("dup {role} master: {e}")))?;
        Ok(SerialPort { role, fd })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn allocates_pts_device() {
        let pty = PtyPair::open().unwrap();
        assert!(pty.slave_path().starts_with("/dev/pts"), "{}", pty.slave_path().display());
        assert!(pty.slave_path().exists());
    }

    #[test]
    fn master_writes_reach_slave_unmodified() {
        let pty = PtyPair::open().unwrap();
        let mut slave = std::fs::File::options()
            .read(true)
            .write(true)
            .open(pty.slave_path())
            .unwrap();

        let mut master = std::fs::File::from(pty.master().try_clone().unwrap());
        master.write_all(b"{\"a\":1}\n").unwrap();

        // Raw mode: no echo, no CR/LF translation.
        let mut buf = [0u8; 8];
        slave.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"{\"a\":1}\n");
    }

    #[test]
    fn slave_writes_reach_attachment() {
        let pty = PtyPair::open().unwrap();
        let port = pty.attachment(SerialRole::Control).unwrap();
        let mut engine_side = std::fs::File::from(port.fd);

        let mut slave = std::fs::File::from(pty.slave().try_clone().unwrap());
        slave.write_all(b"{\"b\":2}\n").unwrap();

        let mut buf = [0u8; 8];
        engine_side.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"{\"b\":2}\n");
    }

    #[test]
    fn attachment_is_a_distinct_descriptor() {
        let pty = PtyPair::open().unwrap();
        let port = pty.attachment(SerialRole::Console).unwrap();
        assert_eq!(port.role, SerialRole::Console);
        assert_ne!(port.fd.as_raw_fd(), pty.master().as_raw_fd());
    }
}
