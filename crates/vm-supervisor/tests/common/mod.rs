#![allow(dead_code)]

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use vm_engine::{
    BootLoader, EngineDelegate, EngineError, EngineEvent, MachineConfig, NetworkAttachment,
    NetworkConfig, SerialRole, VmEngine,
};
use vm_supervisor::RunOptions;

type Hook = Box<dyn FnOnce() + Send + Sync>;

/// What a [`ScriptedEngine`] observed, shared with the test.
#[derive(Debug, Default)]
pub struct Record {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub serial_roles: Mutex<Vec<SerialRole>>,
    /// The control port descriptor handed over at `start`, the end the
    /// guest reads.
    pub control_port: Mutex<Option<OwnedFd>>,
    /// For each probed path, whether it existed when `start` was called.
    pub probed_at_start: Mutex<Vec<bool>>,
}

impl Record {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// An in-process engine that replays a fixed list of events.
///
/// Events with a zero delay are delivered synchronously from `start`, in
/// order, before it returns. The rest follow from a spawned task, each after
/// its delay.
pub struct ScriptedEngine {
    script: Vec<(Duration, EngineEvent)>,
    check_error: Option<String>,
    start_error: Option<String>,
    probe: Vec<PathBuf>,
    on_start: Option<Hook>,
    on_stop: Option<Hook>,
    pub record: Arc<Record>,
}

impl ScriptedEngine {
    pub fn new(events: impl IntoIterator<Item = EngineEvent>) -> Self {
        Self {
            script: events.into_iter().map(|e| (Duration::ZERO, e)).collect(),
            check_error: None,
            start_error: None,
            probe: Vec::new(),
            on_start: None,
            on_stop: None,
            record: Arc::new(Record::default()),
        }
    }

    pub fn then_after(mut self, delay: Duration, event: EngineEvent) -> Self {
        self.script.push((delay, event));
        self
    }

    pub fn failing_check(mut self, reason: &str) -> Self {
        self.check_error = Some(reason.to_string());
        self
    }

    pub fn rejecting_start(mut self, reason: &str) -> Self {
        self.start_error = Some(reason.to_string());
        self
    }

    pub fn probing(mut self, paths: &[PathBuf]) -> Self {
        self.probe = paths.to_vec();
        self
    }

    pub fn on_start(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn on_stop(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl VmEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn check(&self, _config: &MachineConfig) -> vm_engine::Result<()> {
        match &self.check_error {
            Some(reason) => Err(EngineError::BackendNotAvailable(reason.clone())),
            None => Ok(()),
        }
    }

    async fn start(
        &mut self,
        config: MachineConfig,
        delegate: Arc<dyn EngineDelegate>,
    ) -> vm_engine::Result<()> {
        self.record.starts.fetch_add(1, Ordering::SeqCst);
        *self.record.serial_roles.lock().unwrap() =
            config.serial_ports.iter().map(|p| p.role).collect();
        *self.record.control_port.lock().unwrap() = config
            .serial_ports
            .iter()
            .find(|p| p.role == SerialRole::Control)
            .map(|p| p.fd.try_clone().unwrap());
        *self.record.probed_at_start.lock().unwrap() =
            self.probe.iter().map(|p| p.symlink_metadata().is_ok()).collect();

        if let Some(hook) = self.on_start.take() {
            hook();
        }
        if let Some(reason) = &self.start_error {
            return Err(EngineError::StartFailed(reason.clone()));
        }

        let split = self
            .script
            .iter()
            .position(|(delay, _)| !delay.is_zero())
            .unwrap_or(self.script.len());
        let delayed = self.script.split_off(split);
        for (_, event) in self.script.drain(..) {
            delegate.on_event(event);
        }
        if !delayed.is_empty() {
            tokio::spawn(async move {
                for (delay, event) in delayed {
                    tokio::time::sleep(delay).await;
                    delegate.on_event(event);
                }
            });
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.record.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.on_stop.take() {
            hook();
        }
    }
}

/// Published artifact paths inside a test directory.
pub struct Artifacts {
    pub pidfile: PathBuf,
    pub console: PathBuf,
    pub control: PathBuf,
}

impl Artifacts {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            pidfile: dir.join("p"),
            console: dir.join("c"),
            control: dir.join("k"),
        }
    }

    pub fn all(&self) -> Vec<PathBuf> {
        vec![self.pidfile.clone(), self.console.clone(), self.control.clone()]
    }

    pub fn none_exist(&self) -> bool {
        self.all().iter().all(|p| p.symlink_metadata().is_err())
    }
}

/// A minimal valid machine with a kernel file in `dir`.
pub fn machine(dir: &Path) -> MachineConfig {
    let kernel = dir.join("vmlinuz");
    std::fs::write(&kernel, b"").unwrap();
    MachineConfig {
        cpu_count: 1,
        memory_bytes: 512 * 1024 * 1024,
        disks: Vec::new(),
        networks: vec![NetworkConfig {
            mac: None,
            attachment: NetworkAttachment::Nat,
        }],
        boot_loader: BootLoader::Linux {
            kernel,
            initrd: None,
            cmdline: Some("console=hvc0".into()),
        },
        shares: Vec::new(),
        serial_ports: Vec::new(),
        entropy: true,
        balloon: true,
    }
}

/// Run options publishing all three artifacts.
pub fn options(dir: &Path, artifacts: &Artifacts) -> RunOptions {
    let mut options = RunOptions::new(machine(dir));
    options.pidfile = Some(artifacts.pidfile.clone());
    options.console_symlink = Some(artifacts.console.clone());
    options.control_symlink = Some(artifacts.control.clone());
    options
}
