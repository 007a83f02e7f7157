//! Gateway and voice negotiation error handling.

use crate::gateway::CloseCode;
use std::{error::Error as StdError, fmt};

/// Boxed error produced by a registered dispatch handler.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Boxed error produced by a voice backend while standing up a media
/// session.
pub type BackendError = Box<dyn StdError + Send + Sync>;

/// Errors which stop the gateway connection outright.
///
/// Recoverable conditions (ordinary closes, invalid sessions, missed
/// heartbeat acks) are retried internally and never appear here.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The client already has a running connection task.
    AlreadyConnected,
    /// No connection task is running.
    NotConnected,
    /// The gateway closed the connection with a code that must not be
    /// retried.
    CriticalClose(CloseCode),
    /// The configured or bootstrapped gateway URL could not be parsed.
    InvalidGatewayUrl(url::ParseError),
    /// A payload could not be serialised for sending.
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gateway connection failure: ")?;
        match self {
            Error::AlreadyConnected => write!(f, "a connection task is already running."),
            Error::NotConnected => write!(f, "no connection task is running."),
            Error::CriticalClose(code) => write!(f, "gateway refused the connection: {}.", code),
            Error::InvalidGatewayUrl(e) => write!(f, "bad gateway url: {}.", e),
            Error::Json(e) => write!(f, "payload serialisation failed: {}.", e),
        }
    }
}

impl StdError for Error {}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidGatewayUrl(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

/// Error returned when a voice channel join cannot start or complete.
#[derive(Debug)]
#[non_exhaustive]
pub enum JoinError {
    /// The join was cancelled, replaced, or the connection task went away
    /// before the negotiation finished.
    Dropped,
    /// No gateway connection exists to carry the voice state update.
    NotConnected,
    /// The handshake has not completed, so the client's own user is not
    /// yet known.
    NoSession,
    /// The target channel is unknown or is not a voice channel.
    NotVoice,
    /// The guild already has an active or in-flight voice session.
    AlreadyInUse,
    /// The gateway did not deliver both halves of the voice handshake in
    /// the configured time.
    TimedOut,
    /// The voice backend failed to establish the media session.
    Backend(BackendError),
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to join voice channel: ")?;
        match self {
            JoinError::Dropped => write!(f, "request was cancelled or dropped."),
            JoinError::NotConnected => write!(f, "no gateway connection."),
            JoinError::NoSession => write!(f, "gateway handshake has not completed."),
            JoinError::NotVoice => write!(f, "target channel is not a known voice channel."),
            JoinError::AlreadyInUse => write!(f, "guild already has a voice session."),
            JoinError::TimedOut => write!(f, "gateway response timed out."),
            JoinError::Backend(e) => write!(f, "voice backend failure: {}.", e),
        }
    }
}

impl StdError for JoinError {}

impl From<BackendError> for JoinError {
    fn from(e: BackendError) -> Self {
        JoinError::Backend(e)
    }
}

/// Convenience type for voice join handling.
pub type JoinResult<T> = Result<T, JoinError>;
