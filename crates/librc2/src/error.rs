use rc2_protocol::SessionError;
use thiserror::Error;

/// Errors from the compute engine connection and its wire protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("invalid frame header (magic {magic:#x}, length {len})")]
    InvalidHeader { magic: u32, len: u32 },

    #[error("failed to read message: {0}")]
    FailedToReadMessage(String),

    #[error("failed to write: {0}")]
    FailedToWrite(String),

    #[error("not connected to compute engine")]
    NotConnected,

    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("failed to connect to compute engine: {0}")]
    FailedToConnect(String),

    #[error("compute pod crashed too many times")]
    TooManyCrashes,

    #[error("compute engine is unusable")]
    Unusable,

    #[error("unknown compute error: {0}")]
    Unknown(String),
}

/// Errors from the cluster orchestration API.
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("orchestration api connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid orchestration response: {0}")]
    InvalidResponse(String),

    #[error("invalid orchestration configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<reqwest::Error> for OrchestrationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OrchestrationError::InvalidResponse(err.to_string())
        } else {
            OrchestrationError::ConnectionFailed(err.to_string())
        }
    }
}

/// Errors from the data layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaoError {
    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("database connection failed")]
    ConnectionFailed,

    #[error("invalid file")]
    InvalidFile,

    #[error("file version mismatch")]
    VersionMismatch,

    #[error("no such row")]
    NoSuchRow,
}

impl DaoError {
    /// The client-facing error for a failed data layer operation.
    pub fn to_session_error(&self) -> SessionError {
        match self {
            DaoError::QueryFailed(_) => SessionError::DatabaseUpdateFailed,
            DaoError::ConnectionFailed => SessionError::Unknown,
            DaoError::InvalidFile | DaoError::NoSuchRow => SessionError::InvalidRequest,
            DaoError::VersionMismatch => SessionError::FileVersionMismatch,
        }
    }
}

impl From<DaoError> for SessionError {
    fn from(err: DaoError) -> Self {
        err.to_session_error()
    }
}

/// Errors loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
