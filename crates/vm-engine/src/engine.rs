use std::sync::Arc;

use async_trait::async_trait;

use crate::config::MachineConfig;
use crate::error::Result;
use crate::events::EngineDelegate;

#[async_trait]
pub trait VmEngine: Send + Sync {
    /// Human-readable name for this engine implementation (e.g. "qemu").
    fn name(&self) -> &str;
    /// Host-specific checks (binaries, devices, bridge interfaces) that
    /// must pass before any start attempt.
    async fn check(&self, config: &MachineConfig) -> Result<()>;
    /// Request that the guest boot.
    ///
    /// Returning `Ok` only means the request was accepted; the outcome is
    /// reported through `delegate`. An `Err` means the engine rejected the
    /// configuration outright and no event will follow.
    async fn start(&mut self, config: MachineConfig, delegate: Arc<dyn EngineDelegate>)
    -> Result<()>;
    /// Tear the guest down. Safe to call in any state and more than once.
    async fn stop(&mut self);
}
