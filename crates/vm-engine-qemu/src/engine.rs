use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};
use vm_engine::{EngineDelegate, EngineError, EngineEvent, MachineConfig, VmEngine};

use crate::args::{Accel, build_args};
use crate::config::QemuConfig;
use crate::prerequisites::{check_prerequisites, kvm_available};
use crate::process::{describe_exit, kill_process_group};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 4, "invalid EngineState: {v}");
        match v {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Runs one guest as a QEMU child process.
pub struct QemuEngine {
    config: QemuConfig,
    /// Lifecycle state, shared with the monitor task.
    state: Arc<AtomicU8>,
    /// PID (and process group) of the QEMU process once spawned.
    pid: Option<u32>,
    monitor: Option<tokio::task::JoinHandle<()>>,
}

impl QemuEngine {
    pub fn new(config: QemuConfig) -> Self {
        Self {
            config,
            state: Arc::new(AtomicU8::new(EngineState::Idle as u8)),
            pid: None,
            monitor: None,
        }
    }

    fn current_state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically transition between states using CAS. Returns `true` if the
    /// transition succeeded, `false` if the current state did not match `from`.
    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        transition(&self.state, from, to)
    }
}

fn transition(state: &AtomicU8, from: EngineState, to: EngineState) -> bool {
    state
        .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Let QEMU inherit `fd` across exec so `-add-fd` can reference it.
fn inherit(fd: &std::os::fd::OwnedFd) -> Result<(), EngineError> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
        .map(|_| ())
        .map_err(|e| EngineError::StartFailed(format!("clear FD_CLOEXEC: {e}")))
}

#[async_trait]
impl VmEngine for QemuEngine {
    fn name(&self) -> &str {
        "qemu"
    }

    async fn check(&self, config: &MachineConfig) -> vm_engine::Result<()> {
        check_prerequisites(&self.config, config)
    }

    async fn start(
        &mut self,
        config: MachineConfig,
        delegate: Arc<dyn EngineDelegate>,
    ) -> vm_engine::Result<()> {
        if self.current_state() != EngineState::Idle {
            return Err(EngineError::StartFailed(format!(
                "engine already used (state: {})",
                self.current_state()
            )));
        }

        let accel = if kvm_available() {
            Accel::Kvm
        } else {
            warn!("/dev/kvm not accessible, falling back to TCG emulation");
            Accel::Tcg
        };
        let args = build_args(&config, &self.config, accel);
        for port in &config.serial_ports {
            inherit(&port.fd)?;
        }
        debug!(binary = %self.config.binary.display(), ?args, "spawning qemu");

        let child = tokio::process::Command::new(&self.config.binary)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::StartFailed(format!("spawn qemu: {e}")))?;

        // The child holds its own copies of the serial descriptors now.
        drop(config);

        self.pid = child.id();
        self.state
            .store(EngineState::Starting as u8, Ordering::Release);
        self.monitor = Some(tokio::spawn(monitor_process(
            child,
            Arc::clone(&self.state),
            delegate,
            self.config.startup_grace,
        )));
        info!(pid = ?self.pid, "qemu spawned");
        Ok(())
    }

    async fn stop(&mut self) {
        if (self.transition(EngineState::Starting, EngineState::Stopping)
            || self.transition(EngineState::Running, EngineState::Stopping))
            && let Some(pid) = self.pid
        {
            info!(pid, "killing qemu");
            kill_process_group(pid);
        }

        // Reap the process; the monitor task owns the child.
        if let Some(monitor) = self.monitor.take()
            && let Err(e) = monitor.await
        {
            warn!(error = %e, "qemu monitor task failed");
        }
        self.state
            .store(EngineState::Stopped as u8, Ordering::Release);
    }
}

/// Forward QEMU's output to the log and report lifecycle events.
///
/// A process that exits inside `grace` failed to start. Otherwise it is
/// reported as started, and its eventual exit is a guest stop (status 0,
/// QEMU runs with `-no-reboot`) or a runtime failure. Exits caused by
/// [`VmEngine::stop`] are not reported.
async fn monitor_process(
    mut child: Child,
    state: Arc<AtomicU8>,
    delegate: Arc<dyn EngineDelegate>,
    grace: Duration,
) {
    forward_output(&mut child);

    let early_exit = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(grace) => None,
    };

    if let Some(status) = early_exit {
        let prev = EngineState::from_u8(state.swap(EngineState::Stopped as u8, Ordering::AcqRel));
        if prev == EngineState::Starting {
            let reason = match status {
                Ok(status) => format!("qemu exited during startup ({})", describe_exit(status)),
                Err(e) => format!("wait for qemu: {e}"),
            };
            warn!(%reason, "qemu failed to start");
            delegate.on_event(EngineEvent::StartFailed(reason));
        }
        return;
    }

    if transition(&state, EngineState::Starting, EngineState::Running) {
        info!("qemu running");
        delegate.on_event(EngineEvent::Started);
    }

    let status = child.wait().await;
    let prev = EngineState::from_u8(state.swap(EngineState::Stopped as u8, Ordering::AcqRel));
    if prev != EngineState::Running {
        return;
    }
    match status {
        Ok(status) if status.success() => {
            info!("guest stopped");
            delegate.on_event(EngineEvent::GuestStopped);
        }
        Ok(status) => {
            let reason = format!("qemu exited unexpectedly ({})", describe_exit(status));
            warn!(%reason, "guest failed");
            delegate.on_event(EngineEvent::RuntimeFailed(reason));
        }
        Err(e) => {
            delegate.on_event(EngineEvent::RuntimeFailed(format!("wait for qemu: {e}")));
        }
    }
}

fn forward_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    info!(target: "qemu", "{line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(target: "qemu", "stderr: {line}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use tokio::sync::mpsc;
    use vm_engine::BootLoader;

    use super::*;

    struct ChannelDelegate(mpsc::UnboundedSender<EngineEvent>);

    impl EngineDelegate for ChannelDelegate {
        fn on_event(&self, event: EngineEvent) {
            let _ = self.0.send(event);
        }
    }

    /// Delegate that only records, for tests that must see no events.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<EngineEvent>>);

    impl EngineDelegate for Recorder {
        fn on_event(&self, event: EngineEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn machine(dir: &Path) -> MachineConfig {
        let kernel = dir.join("vmlinuz");
        std::fs::write(&kernel, b"").unwrap();
        MachineConfig {
            cpu_count: 1,
            memory_bytes: 256 * 1024 * 1024,
            disks: Vec::new(),
            networks: Vec::new(),
            boot_loader: BootLoader::Linux {
                kernel,
                initrd: None,
                cmdline: None,
            },
            shares: Vec::new(),
            serial_ports: Vec::new(),
            entropy: false,
            balloon: false,
        }
    }

    /// A fake QEMU: a shell script that ignores its arguments.
    fn fake_qemu(dir: &Path, body: &str) -> QemuConfig {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-qemu");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        QemuConfig {
            binary: path,
            machine_type: "q35".into(),
            startup_grace: Duration::from_millis(200),
        }
    }

    async fn start(
        config: QemuConfig,
        dir: &Path,
    ) -> (QemuEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut engine = QemuEngine::new(config);
        engine
            .start(machine(dir), Arc::new(ChannelDelegate(tx)))
            .await
            .unwrap();
        (engine, rx)
    }

    #[tokio::test]
    async fn early_exit_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, mut rx) = start(fake_qemu(dir.path(), "exit 1"), dir.path()).await;

        match rx.recv().await.unwrap() {
            EngineEvent::StartFailed(reason) => {
                assert!(reason.contains("exit code 1"), "reason was: {reason}")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_exit_after_grace_is_guest_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, mut rx) = start(fake_qemu(dir.path(), "sleep 0.5; exit 0"), dir.path()).await;

        assert_eq!(rx.recv().await.unwrap(), EngineEvent::Started);
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::GuestStopped);
    }

    #[tokio::test]
    async fn failing_exit_after_grace_is_runtime_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_engine, mut rx) = start(fake_qemu(dir.path(), "sleep 0.5; exit 7"), dir.path()).await;

        assert_eq!(rx.recv().await.unwrap(), EngineEvent::Started);
        match rx.recv().await.unwrap() {
            EngineEvent::RuntimeFailed(reason) => {
                assert!(reason.contains("exit code 7"), "reason was: {reason}")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_kills_without_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = QemuEngine::new(fake_qemu(dir.path(), "sleep 30"));
        engine
            .start(machine(dir.path()), Arc::new(ChannelDelegate(tx)))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::Started);

        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.current_state(), EngineState::Stopped);
        assert!(rx.try_recv().is_err(), "stop must not produce events");
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let mut engine = QemuEngine::new(QemuConfig::default());
        engine.stop().await;
        assert_eq!(engine.current_state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_is_synchronous_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = QemuConfig {
            binary: PathBuf::from("/nonexistent/qemu"),
            ..QemuConfig::default()
        };
        let recorder = Arc::new(Recorder::default());
        let mut engine = QemuEngine::new(config);
        let err = engine
            .start(machine(dir.path()), recorder.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StartFailed(_)), "got {err:?}");
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _rx) = start(fake_qemu(dir.path(), "sleep 30"), dir.path()).await;

        let recorder = Arc::new(Recorder::default());
        let err = engine
            .start(machine(dir.path()), recorder)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already used"), "error was: {err}");
        engine.stop().await;
    }
}
