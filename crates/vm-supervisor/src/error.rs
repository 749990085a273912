use std::io;

use tracing::{debug, warn};
use vm_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("pty allocation failed: {0}")]
    PtyAllocation(String),

    #[error("engine start failed: {0}")]
    EngineStart(String),

    #[error("engine runtime failure: {0}")]
    EngineRuntime(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

impl From<EngineError> for SupervisorError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidConfig(msg) => Self::Config(msg),
            EngineError::BackendNotAvailable(msg) | EngineError::StartFailed(msg) => {
                Self::EngineStart(msg)
            }
            EngineError::Io(e) => Self::Io(e),
        }
    }
}

/// Apply the non-fatal I/O policy to `result`: log the failure and carry on.
///
/// `NotFound` is expected during cleanup and only logged at debug level.
pub(crate) fn nonfatal<T>(what: &str, result: io::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(error = %e, "{what} failed (ignored)");
            None
        }
        Err(e) => {
            warn!(error = %e, "{what} failed (ignored)");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_taxonomy() {
        let config: SupervisorError = EngineError::InvalidConfig("bad".into()).into();
        assert!(matches!(config, SupervisorError::Config(_)));

        let start: SupervisorError = EngineError::BackendNotAvailable("no qemu".into()).into();
        assert!(matches!(start, SupervisorError::EngineStart(_)));

        let io: SupervisorError = EngineError::Io(io::Error::other("boom")).into();
        assert!(matches!(io, SupervisorError::Io(_)));
    }

    #[test]
    fn nonfatal_swallows_errors() {
        assert_eq!(nonfatal("ok", Ok::<_, io::Error>(3)), Some(3));
        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(nonfatal::<()>("remove", Err(missing)), None);
        assert_eq!(nonfatal::<()>("write", Err(io::Error::other("EIO"))), None);
    }
}
