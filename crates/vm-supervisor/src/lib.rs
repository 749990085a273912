//! Supervises one virtual machine guest: allocates the console and control
//! ptys, publishes their symlinks and the pid file, forwards host signals
//! and resume events to a single run loop, and removes every published
//! artifact exactly once on the way out.

pub mod cli;
pub mod config;
pub mod console;
pub mod control;
pub mod error;
pub mod lifecycle;
pub mod pty;
pub mod registry;
pub mod signals;
pub mod supervisor;
pub mod wake;

pub use error::{SupervisorError, SupervisorResult};
pub use lifecycle::{Event, LifecycleState};
pub use supervisor::{Outcome, RunOptions, Supervisor};
