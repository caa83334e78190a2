use thiserror::Error;

/// GNSS coordinator error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GnssError {
    #[error("Engine init failed")]
    EngineInit,

    #[error("Engine call failed: {0}")]
    EngineCall(&'static str),

    #[error("Navigation already started")]
    AlreadyNavigating,

    #[error("Provider not enabled")]
    NotEnabled,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Unknown aiding data: {0}")]
    UnknownAidingData(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Not supported by engine: {0}")]
    Unsupported(&'static str),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Observer is gone")]
    ObserverGone,

    #[error("Worker stopped")]
    WorkerStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ini::Error> for GnssError {
    fn from(err: ini::Error) -> Self {
        GnssError::Config(err.to_string())
    }
}

impl From<ini::ParseError> for GnssError {
    fn from(err: ini::ParseError) -> Self {
        GnssError::Config(err.to_string())
    }
}

/// Result type for coordinator operations
pub type GnssResult<T> = Result<T, GnssError>;

impl GnssError {
    /// Errors a caller may fix by re-issuing a different request
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            GnssError::AlreadyNavigating
                | GnssError::InvalidCommand(_)
                | GnssError::UnknownAidingData(_)
                | GnssError::InvalidParameters(_)
                | GnssError::Unsupported(_)
        )
    }
}
