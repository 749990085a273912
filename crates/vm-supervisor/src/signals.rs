use std::fmt;

use tokio::signal::unix::{Signal, SignalKind as OsSignal, signal};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lifecycle::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Interrupt,
    Terminate,
    BrokenPipe,
    Hangup,
}

impl SignalKind {
    /// Whether this signal asks the supervisor to shut down.
    pub fn is_termination(self) -> bool {
        matches!(self, Self::Interrupt | Self::Terminate)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
            Self::BrokenPipe => f.write_str("SIGPIPE"),
            Self::Hangup => f.write_str("SIGHUP"),
        }
    }
}

/// Replaces the default disposition of SIGINT, SIGTERM, SIGPIPE and SIGHUP
/// and forwards each delivery onto the event queue.
///
/// Registration happens synchronously in [`SignalSupervisor::install`], so a
/// signal arriving any time after it returns is queued rather than killing
/// the process.
#[derive(Debug)]
pub struct SignalSupervisor {
    task: JoinHandle<()>,
}

impl SignalSupervisor {
    pub fn install(events: UnboundedSender<Event>) -> Self {
        let mut sigint = register(OsSignal::interrupt(), SignalKind::Interrupt);
        let mut sigterm = register(OsSignal::terminate(), SignalKind::Terminate);
        let mut sigpipe = register(OsSignal::pipe(), SignalKind::BrokenPipe);
        let mut sighup = register(OsSignal::hangup(), SignalKind::Hangup);

        let task = tokio::spawn(async move {
            loop {
                let kind = tokio::select! {
                    _ = recv_signal(&mut sigint) => SignalKind::Interrupt,
                    _ = recv_signal(&mut sigterm) => SignalKind::Terminate,
                    _ = recv_signal(&mut sigpipe) => SignalKind::BrokenPipe,
                    _ = recv_signal(&mut sighup) => SignalKind::Hangup,
                };
                if kind.is_termination() {
                    info!(signal = %kind, "received termination signal");
                } else {
                    debug!(signal = %kind, "received signal");
                }
                if events.send(Event::SignalReceived(kind)).is_err() {
                    return;
                }
            }
        });
        Self { task }
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for SignalSupervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn register(os: OsSignal, kind: SignalKind) -> Option<Signal> {
    match signal(os) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(signal = %kind, error = %e, "failed to install signal handler");
            None
        }
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            if s.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
