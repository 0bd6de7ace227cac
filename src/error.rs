use std::fmt;
use std::io;

use thiserror::Error;

use crate::packet::Mode;

/// Classification reported alongside every engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    #[default]
    NoError,
    AbortedByUser,
    HostNotFound,
    ConnectionRefused,
    TransmissionTimedOut,
    NotConnected,
    UnsupportedMode,
    ProtocolError,
    UnknownError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Error)]
pub enum TftpError {
    #[error("Lookup failed: {0}")]
    HostNotFound(String),
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Not connected")]
    NotConnected,
    #[error("Transfer mode {0} not supported")]
    UnsupportedMode(Mode),
    #[error("A transfer is already in progress")]
    TransferInProgress,
    #[error("Operation aborted")]
    AbortedByUser,
    #[error("Transmission timed out")]
    TransmissionTimedOut,
    #[error("Protocol error {code}: {message}")]
    ProtocolError { code: u16, message: String },
    #[error("Engine stopped")]
    EngineStopped,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TftpError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TftpError::HostNotFound(_) => ErrorCode::HostNotFound,
            TftpError::ConnectionRefused => ErrorCode::ConnectionRefused,
            TftpError::NotConnected | TftpError::TransferInProgress => ErrorCode::NotConnected,
            TftpError::UnsupportedMode(_) => ErrorCode::UnsupportedMode,
            TftpError::AbortedByUser => ErrorCode::AbortedByUser,
            TftpError::TransmissionTimedOut => ErrorCode::TransmissionTimedOut,
            TftpError::ProtocolError { .. } => ErrorCode::ProtocolError,
            TftpError::EngineStopped | TftpError::Io(_) => ErrorCode::UnknownError,
        }
    }

    /// Text handed to event consumers. Peer messages are passed through verbatim.
    pub fn message(&self) -> String {
        match self {
            TftpError::ProtocolError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
