use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Malformed start line: {0}")]
    MalformedStartLine(String),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Truncated body: declared {declared} bytes, got {actual}")]
    TruncatedBody { declared: usize, actual: usize },

    #[error("Malformed SDP: {0}")]
    MalformedSdp(String),

    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Alarm not found: {0}")]
    AlarmNotFound(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Registration failed: {0}")]
    RegisterFailed(String),

    #[error("No free RTP port")]
    PortExhausted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
