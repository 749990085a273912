//! The run loop for one supervised guest.
//!
//! Engine callbacks, signals and wake notifications are all turned into
//! [`Event`]s on one unbounded queue. The loop applies them to the
//! [`Lifecycle`] one at a time, and the first stop it sees leads into
//! `quit`, the only exit path once the engine has been started.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use vm_engine::{EngineDelegate, EngineEvent, MachineConfig, VmEngine};

use crate::console::ConsoleChannel;
use crate::control::ControlChannel;
use crate::error::{SupervisorError, SupervisorResult};
use crate::lifecycle::{Action, Event, Lifecycle, LifecycleState, StopCause};
use crate::registry::ResourceRegistry;
use crate::signals::SignalSupervisor;
use crate::wake::{self, DEFAULT_POLL_INTERVAL, WakeNotifier};

/// Everything needed for one run, minus the serial ports, which the
/// supervisor allocates itself.
#[derive(Debug)]
pub struct RunOptions {
    pub machine: MachineConfig,
    pub pidfile: Option<PathBuf>,
    pub console_symlink: Option<PathBuf>,
    pub control_symlink: Option<PathBuf>,
    /// Accepted for compatibility; has no effect.
    pub escape_sequence: Option<String>,
    pub wake_poll_interval: Duration,
}

impl RunOptions {
    pub fn new(machine: MachineConfig) -> Self {
        Self {
            machine,
            pidfile: None,
            console_symlink: None,
            control_symlink: None,
            escape_sequence: None,
            wake_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub struct Outcome {
    pub state: LifecycleState,
    pub exit_code: u8,
    pub error: Option<SupervisorError>,
}

impl Outcome {
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_code)
    }
}

/// Forwards engine callbacks onto the event queue.
struct QueueDelegate {
    events: UnboundedSender<Event>,
}

impl EngineDelegate for QueueDelegate {
    fn on_event(&self, event: EngineEvent) {
        let event = match event {
            EngineEvent::Started => Event::EngineStarted,
            EngineEvent::StartFailed(reason) => Event::EngineFailed(reason),
            EngineEvent::GuestStopped => Event::GuestStopped,
            EngineEvent::RuntimeFailed(reason) => Event::EngineRuntimeFailed(reason),
        };
        if self.events.send(event).is_err() {
            debug!("event queue closed, engine event dropped");
        }
    }
}

/// Channels and background tasks that live for the duration of a run.
struct Session {
    _console: ConsoleChannel,
    control: ControlChannel,
    wake: Option<WakeNotifier>,
}

pub struct Supervisor {
    lifecycle: Lifecycle,
    registry: ResourceRegistry,
    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            lifecycle: Lifecycle::new(),
            registry: ResourceRegistry::new(),
            events_tx,
            events_rx,
        }
    }

    /// A handle for posting events into the run loop.
    pub fn events(&self) -> UnboundedSender<Event> {
        self.events_tx.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Drive `engine` through one full run and return how it ended.
    ///
    /// Filesystem artifacts are removed before this returns on every path.
    pub async fn run(mut self, options: RunOptions, engine: &mut dyn VmEngine) -> Outcome {
        self.lifecycle
            .advance(LifecycleState::Initializing, LifecycleState::Configuring);
        let signals = SignalSupervisor::install(self.events_tx.clone());

        if options.escape_sequence.is_some() {
            warn!("--escape-sequence is reserved and has no effect");
        }
        let wake_poll_interval = options.wake_poll_interval;

        let (mut session, machine) = match self.prepare(options, engine).await {
            Ok(prepared) => prepared,
            Err(e) => {
                signals.shutdown();
                return self.fail_setup(e);
            }
        };

        self.lifecycle
            .advance(LifecycleState::Configuring, LifecycleState::Starting);
        info!(
            engine = engine.name(),
            cpus = machine.cpu_count,
            memory_mib = machine.memory_mib(),
            "starting guest"
        );
        let delegate = Arc::new(QueueDelegate {
            events: self.events_tx.clone(),
        });
        if let Err(e) = engine.start(machine, delegate).await {
            warn!(error = %e, "engine rejected start request");
            if self.events_tx.send(Event::EngineFailed(e.to_string())).is_err() {
                debug!("event queue closed, start failure dropped");
            }
        }
        session.wake = Some(WakeNotifier::spawn(self.events_tx.clone(), wake_poll_interval));

        let cause = self.event_loop(&session).await;
        self.quit(engine, session, signals, cause).await
    }

    /// Configuring: validate, then publish artifacts and open both channels.
    async fn prepare(
        &self,
        options: RunOptions,
        engine: &mut dyn VmEngine,
    ) -> SupervisorResult<(Session, MachineConfig)> {
        let RunOptions {
            mut machine,
            pidfile,
            console_symlink,
            control_symlink,
            ..
        } = options;
        machine.validate()?;
        engine.check(&machine).await?;

        if let Some(pidfile) = &pidfile {
            self.registry.publish_pid_file(pidfile)?;
        }
        let console = ConsoleChannel::open(&self.registry, console_symlink.as_deref())?;
        let control = ControlChannel::open(&self.registry, control_symlink.as_deref())?;

        machine.serial_ports.push(console.attachment()?);
        machine.serial_ports.push(control.attachment()?);

        Ok((
            Session {
                _console: console,
                control,
                wake: None,
            },
            machine,
        ))
    }

    async fn event_loop(&mut self, session: &Session) -> StopCause {
        loop {
            let Some(event) = self.events_rx.recv().await else {
                return StopCause::RuntimeFailed("event queue closed".into());
            };
            debug!(?event, state = %self.lifecycle.state(), "event");

            match self.lifecycle.apply(&event) {
                Some(Action::Stop(cause)) => {
                    info!(%cause, "stopping guest");
                    return cause;
                }
                Some(Action::SendTimeUpdate) => {
                    wake::notify_guest(&session.control);
                }
                None if event == Event::EngineStarted => {
                    info!("guest running");
                }
                None => {}
            }
        }
    }

    /// Stopping: tear everything down exactly once and pick the exit status.
    async fn quit(
        mut self,
        engine: &mut dyn VmEngine,
        session: Session,
        signals: SignalSupervisor,
        cause: StopCause,
    ) -> Outcome {
        engine.stop().await;
        session.control.close();
        if let Some(wake) = &session.wake {
            wake.shutdown();
        }

        // Anything still queued is applied against Stopping: stop triggers
        // are absorbed, wake events still try the (closed) control channel.
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(Action::SendTimeUpdate) = self.lifecycle.apply(&event) {
                wake::notify_guest(&session.control);
            }
        }

        self.registry.cleanup_all();
        signals.shutdown();

        let state = self.lifecycle.finish(cause.terminal_state());
        let exit_code = cause.exit_code();
        let error = cause.into_error();
        match &error {
            Some(e) => error!(%state, exit_code, error = %e, "supervisor exiting"),
            None => info!(%state, exit_code, "supervisor exiting"),
        }
        Outcome {
            state,
            exit_code,
            error,
        }
    }

    /// Configuring -> Failed without the engine ever being started.
    fn fail_setup(self, e: SupervisorError) -> Outcome {
        error!(error = %e, "setup failed");
        self.registry.cleanup_all();
        let state = self.lifecycle.finish(LifecycleState::Failed);
        info!(%state, exit_code = 1, "supervisor exiting");
        Outcome {
            state,
            exit_code: 1,
            error: Some(e),
        }
    }
}
