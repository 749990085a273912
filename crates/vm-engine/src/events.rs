/// Lifecycle notifications an engine reports for one run.
///
/// `Started` or `StartFailed` arrives exactly once after a successful
/// [`crate::VmEngine::start`] call. After `Started`, at most one of
/// `GuestStopped` or `RuntimeFailed` follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Started,
    StartFailed(String),
    /// The guest powered itself off.
    GuestStopped,
    RuntimeFailed(String),
}

/// Receiver for [`EngineEvent`]s.
///
/// Engines may call this from any thread, so implementations must only hand
/// the event off (e.g. onto a queue) and return.
pub trait EngineDelegate: Send + Sync {
    fn on_event(&self, event: EngineEvent);
}
