#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("engine start failed: {0}")]
    StartFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
