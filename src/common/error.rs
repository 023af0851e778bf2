//! Error types for the supervisor

use std::io;
use thiserror::Error;

/// Supervisor error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Malformed handshake line or unexpected stream shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport reported `ERROR` during the handshake.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Service already running, cannot {0}")]
    AlreadyRunning(String),

    #[error("Service {0} was stopped before negotiation finished")]
    Stopped(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn negotiation<S: Into<String>>(msg: S) -> Self {
        Error::Negotiation(msg.into())
    }

    pub fn process<S: Into<String>>(msg: S) -> Self {
        Error::Process(msg.into())
    }

    pub fn already_running<S: Into<String>>(action: S) -> Self {
        Error::AlreadyRunning(action.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::Auth(msg.into())
    }

    pub fn http<S: Into<String>>(msg: S) -> Self {
        Error::Http(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Errors the connection manager recovers from by rotating to the
    /// next connection.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::Internal(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Parse(format!("could not b64 decode: {}", e))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<tokio_util::codec::LinesCodecError> for Error {
    fn from(e: tokio_util::codec::LinesCodecError) -> Self {
        match e {
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                Error::Protocol("line exceeds maximum length".to_string())
            }
            tokio_util::codec::LinesCodecError::Io(e) => Error::Io(e),
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
