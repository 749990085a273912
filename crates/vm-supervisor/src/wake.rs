//! Host resume detection.
//!
//! Linux has no wake callback for an unprivileged process, so suspend is
//! inferred from the clocks: `CLOCK_BOOTTIME` keeps counting while the
//! host sleeps and `CLOCK_MONOTONIC` does not. A jump in their difference
//! between two samples means the host was suspended in between.

use std::time::Duration;

use nix::time::{ClockId, clock_gettime};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::control::{ControlChannel, ControlMessage};
use crate::lifecycle::Event;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Smallest offset jump reported as a suspend. Larger than the skew
/// between two back-to-back clock reads.
pub const SUSPEND_THRESHOLD: Duration = Duration::from_secs(1);

/// Time the host has spent suspended since boot, as seen right now.
pub fn suspended_since_boot() -> nix::Result<Duration> {
    let boot = clock_gettime(ClockId::CLOCK_BOOTTIME)?;
    let mono = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    Ok(Duration::from(boot).saturating_sub(Duration::from(mono)))
}

#[derive(Debug)]
pub struct SuspendDetector {
    last: Duration,
    threshold: Duration,
}

impl SuspendDetector {
    pub fn new(initial: Duration, threshold: Duration) -> Self {
        Self {
            last: initial,
            threshold,
        }
    }

    /// Record a new sample. Returns how long the host slept if the offset
    /// grew by at least the threshold over the highest earlier sample.
    /// Samples below that baseline are ignored.
    pub fn observe(&mut self, sample: Duration) -> Option<Duration> {
        let slept = sample.saturating_sub(self.last);
        self.last = self.last.max(sample);
        (slept >= self.threshold).then_some(slept)
    }
}

/// Background task posting [`Event::WakeOccurred`] on every detected resume.
#[derive(Debug)]
pub struct WakeNotifier {
    task: JoinHandle<()>,
}

impl WakeNotifier {
    pub fn spawn(events: UnboundedSender<Event>, interval: Duration) -> Self {
        Self::spawn_with(events, interval, suspended_since_boot)
    }

    /// Like [`WakeNotifier::spawn`] with a custom offset source.
    pub fn spawn_with<F>(events: UnboundedSender<Event>, interval: Duration, mut sample: F) -> Self
    where
        F: FnMut() -> nix::Result<Duration> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let initial = match sample() {
                Ok(offset) => offset,
                Err(e) => {
                    warn!(error = %e, "clock unavailable, wake detection disabled");
                    return;
                }
            };
            let mut detector = SuspendDetector::new(initial, SUSPEND_THRESHOLD);

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let offset = match sample() {
                    Ok(offset) => offset,
                    Err(e) => {
                        debug!(error = %e, "clock sample failed");
                        continue;
                    }
                };
                if let Some(slept) = detector.observe(offset) {
                    info!(slept_ms = slept.as_millis(), "host resumed from sleep");
                    if events.send(Event::WakeOccurred).is_err() {
                        return;
                    }
                }
            }
        });
        Self { task }
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for WakeNotifier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Tell the guest the current host time. Best effort.
pub fn notify_guest(control: &ControlChannel) -> bool {
    control.send(&ControlMessage::time_update_now())
}
