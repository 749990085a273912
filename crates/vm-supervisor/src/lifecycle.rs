//! Guest lifecycle state machine.
//!
//! [`transition`] is a pure function from the current state and one queued
//! event to the next state plus at most one action. [`Lifecycle`] holds the
//! shared state and applies transitions with compare-and-swap, so the first
//! event that moves the run into `Stopping` is the only one that gets a
//! [`Action::Stop`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::SupervisorError;
use crate::signals::SignalKind;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing = 0,
    Configuring = 1,
    Starting = 2,
    Running = 3,
    Stopping = 4,
    Stopped = 5,
    Failed = 6,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 6, "invalid LifecycleState: {v}");
        match v {
            0 => Self::Initializing,
            1 => Self::Configuring,
            2 => Self::Starting,
            3 => Self::Running,
            4 => Self::Stopping,
            5 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// States in which the engine may be running and the control channel is open.
    fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => f.write_str("initializing"),
            Self::Configuring => f.write_str("configuring"),
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Everything that can reach the run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    EngineStarted,
    EngineFailed(String),
    GuestStopped,
    EngineRuntimeFailed(String),
    SignalReceived(SignalKind),
    WakeOccurred,
}

/// Why the run is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    GuestStopped,
    Signal(SignalKind),
    StartFailed(String),
    RuntimeFailed(String),
}

impl StopCause {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::GuestStopped => 0,
            _ => 1,
        }
    }

    pub fn terminal_state(&self) -> LifecycleState {
        match self {
            Self::GuestStopped | Self::Signal(_) => LifecycleState::Stopped,
            Self::StartFailed(_) | Self::RuntimeFailed(_) => LifecycleState::Failed,
        }
    }

    /// The engine error behind this stop, if there is one.
    pub fn into_error(self) -> Option<SupervisorError> {
        match self {
            Self::StartFailed(reason) => Some(SupervisorError::EngineStart(reason)),
            Self::RuntimeFailed(reason) => Some(SupervisorError::EngineRuntime(reason)),
            Self::GuestStopped | Self::Signal(_) => None,
        }
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GuestStopped => f.write_str("guest stopped"),
            Self::Signal(kind) => write!(f, "{kind}"),
            Self::StartFailed(reason) => write!(f, "start failed: {reason}"),
            Self::RuntimeFailed(reason) => write!(f, "runtime failure: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendTimeUpdate,
    Stop(StopCause),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub next: LifecycleState,
    pub action: Option<Action>,
}

impl Step {
    fn stay(state: LifecycleState) -> Self {
        Self {
            next: state,
            action: None,
        }
    }

    fn stop(cause: StopCause) -> Self {
        Self {
            next: LifecycleState::Stopping,
            action: Some(Action::Stop(cause)),
        }
    }
}

pub fn transition(state: LifecycleState, event: &Event) -> Step {
    use LifecycleState::{Running, Starting};

    match (state, event) {
        (s, Event::WakeOccurred) if s.is_live() => Step {
            next: s,
            action: Some(Action::SendTimeUpdate),
        },
        (s, Event::SignalReceived(kind)) if !kind.is_termination() => Step::stay(s),

        (Starting, Event::EngineStarted) => Step::stay(Running),
        (Starting, Event::EngineFailed(reason)) => {
            Step::stop(StopCause::StartFailed(reason.clone()))
        }
        (Running, Event::EngineFailed(reason))
        | (Starting | Running, Event::EngineRuntimeFailed(reason)) => {
            Step::stop(StopCause::RuntimeFailed(reason.clone()))
        }
        (Starting | Running, Event::GuestStopped) => Step::stop(StopCause::GuestStopped),
        (Starting | Running, Event::SignalReceived(kind)) => Step::stop(StopCause::Signal(*kind)),

        // Stopping already won, terminal states absorb, and nothing is
        // running before Starting.
        (s, _) => Step::stay(s),
    }
}

/// Shared lifecycle state.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Initializing as u8),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically move from `from` to `to`. Returns `false` if the current
    /// state was not `from`.
    pub fn advance(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Apply `event` and return the action it calls for, if any.
    ///
    /// Racing callers each see the state they actually moved from, so at
    /// most one of them ever receives [`Action::Stop`].
    pub fn apply(&self, event: &Event) -> Option<Action> {
        loop {
            let current = self.state();
            let step = transition(current, event);
            if step.next == current || self.advance(current, step.next) {
                return step.action;
            }
        }
    }

    /// Enter a terminal state. Has no effect once terminal.
    pub fn finish(&self, terminal: LifecycleState) -> LifecycleState {
        debug_assert!(terminal.is_terminal());
        loop {
            let current = self.state();
            if current.is_terminal() || self.advance(current, terminal) {
                return self.state();
            }
        }
    }
}
