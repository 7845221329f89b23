use honfig_network::{ListenerError, SessionError};
use thiserror::Error;

use crate::instance::InstanceState;

/// Failure taxonomy of the manager core. The REST layer above maps these to
/// response codes with [`status_code`](Error::status_code).
#[derive(Debug, Error)]
pub enum Error {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("no free instance slots")]
    ResourceExhausted,
    #[error("instance {0} not found")]
    InstanceNotFound(u32),
    #[error("{op} is invalid while {state:?}")]
    StateViolation {
        op: &'static str,
        state: InstanceState,
    },
    #[error("{0} deadline expired")]
    Timeout(&'static str),
    #[error("replay upload failed: {0}")]
    UploadFailed(String),
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// The HTTP status for this error when surfaced through a REST command.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::StateViolation { .. } => 409,
            Self::InstanceNotFound(_) => 404,
            Self::ResourceExhausted => 503,
            _ => 500,
        }
    }
}

impl From<ListenerError> for Error {
    fn from(e: ListenerError) -> Self {
        match e {
            ListenerError::Bind { source, .. } => Self::Connect(source),
        }
    }
}

impl From<SessionError> for Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Connect(source) | SessionError::Io(source) => Self::Connect(source),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_status_mapping() {
        let violation = Error::StateViolation {
            op: "start",
            state: InstanceState::Starting,
        };
        assert_eq!(violation.status_code(), 409);
        assert_eq!(Error::InstanceNotFound(3).status_code(), 404);
        assert_eq!(Error::ResourceExhausted.status_code(), 503);
        assert_eq!(Error::Timeout("startup").status_code(), 500);
        assert_eq!(Error::Config("bad".to_owned()).status_code(), 500);
    }
}
