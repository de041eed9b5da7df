use thiserror::Error;

/// Errors produced by the parley protocol layer.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("duplicate session: {0}")]
    DuplicateSession(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("directory error: {0}")]
    Directory(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ParleyError {
    /// Text carried in the `error` field of a 400 reply for this error.
    pub fn wire_reason(&self) -> &'static str {
        match self {
            ParleyError::DuplicateSession(_) => "name already in use",
            ParleyError::UnknownUser(_) => "user not registered",
            ParleyError::AuthFailed(_) => "wrong password",
            ParleyError::UnknownDestination(_) => "user not registered",
            ParleyError::Directory(_) => "directory unavailable",
            _ => "malformed request",
        }
    }

    /// Whether this error means the peer's socket is gone.
    pub fn is_peer_loss(&self) -> bool {
        matches!(
            self,
            ParleyError::PeerUnreachable(_) | ParleyError::Io(_) | ParleyError::Timeout
        )
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(e: serde_json::Error) -> Self {
        ParleyError::MalformedMessage(e.to_string())
    }
}

pub type ParleyResult<T> = Result<T, ParleyError>;
