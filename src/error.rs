use std::fmt;
use std::io;
use std::sync::Arc;

use crate::message::{Alert, AlertDescription};

/// Errors surfaced by the connector.
///
/// Every error is attributed to a single peer or a single outbound message.
/// Nothing here stops the connector as a whole.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Handshake failed: {0}")]
    Handshake(HandshakeFailure),

    #[error("Connection store exhausted")]
    ConnectionStoreExhausted,

    #[error("Message too large ({0} bytes)")]
    MessageTooLarge(usize),

    #[error("Outbound message overflow")]
    OutboundOverflow,

    #[error("Endpoint context mismatch")]
    EndpointMismatch,

    #[error("Connector is not running")]
    NotRunning,

    #[error("Timeout: {0}")]
    Timeout(&'static str),

    #[error("Connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<HandshakeFailure> for Error {
    fn from(value: HandshakeFailure) -> Self {
        Error::Handshake(value)
    }
}

/// A protocol level failure raised while processing handshake messages.
///
/// The alert level decides what happens next: FATAL terminates the
/// handshake (and the alert is sent to the peer), WARNING means the
/// offending record is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFailure {
    alert: Alert,
    reason: String,
}

impl HandshakeFailure {
    pub fn fatal(description: AlertDescription, reason: impl Into<String>) -> Self {
        HandshakeFailure {
            alert: Alert::fatal(description),
            reason: reason.into(),
        }
    }

    pub fn warning(description: AlertDescription, reason: impl Into<String>) -> Self {
        HandshakeFailure {
            alert: Alert::warning(description),
            reason: reason.into(),
        }
    }

    pub fn alert(&self) -> Alert {
        self.alert
    }

    pub fn is_fatal(&self) -> bool {
        self.alert.is_fatal()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.reason, self.alert)
    }
}
