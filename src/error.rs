use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Channel resolution failed: {0}")]
    ChannelResolution(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Data channel error: {0}")]
    DataChannel(String),

    #[error("Candidate rejected: {0}")]
    Candidate(String),

    #[error("Candidate sent on a batched-exchange session")]
    CandidateStrategyViolation,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// The session never reached a usable state
    Session,
    /// One remote peer is lost, the others keep going
    Peer,
    /// Logged and skipped
    Recoverable,
}

impl AppError {
    /// Classify the error for propagation
    pub fn scope(&self) -> ErrorScope {
        match self {
            AppError::ChannelResolution(_)
            | AppError::Credential(_)
            | AppError::DirectoryUnavailable(_)
            | AppError::Signaling(_)
            | AppError::Config(_)
            | AppError::Stopped
            | AppError::Io(_) => ErrorScope::Session,
            AppError::Negotiation(_) | AppError::TransportUnavailable(_) => ErrorScope::Peer,
            AppError::DeviceUnavailable(_)
            | AppError::DataChannel(_)
            | AppError::Candidate(_)
            | AppError::CandidateStrategyViolation
            | AppError::Serialization(_) => ErrorScope::Recoverable,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
