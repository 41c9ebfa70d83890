use std::fmt;
use std::net::SocketAddr;

use crate::message::{CipherSuite, SessionId};

/// Security attributes of the session a message was, or is to be, exchanged under.
///
/// Delivered with every inbound message and with every send completion.
/// An outbound message may carry a requested context, which the configured
/// [`EndpointContextMatcher`] compares against the actual one before sending.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointContext {
    peer: SocketAddr,
    session_id: Option<SessionId>,
    epoch: Option<u16>,
    cipher_suite: Option<CipherSuite>,
}

impl EndpointContext {
    /// A context that only names the peer.
    pub fn new(peer: SocketAddr) -> Self {
        EndpointContext {
            peer,
            session_id: None,
            epoch: None,
            cipher_suite: None,
        }
    }

    pub fn with_session(
        peer: SocketAddr,
        session_id: SessionId,
        epoch: u16,
        cipher_suite: Option<CipherSuite>,
    ) -> Self {
        EndpointContext {
            peer,
            session_id: Some(session_id),
            epoch: Some(epoch),
            cipher_suite,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn epoch(&self) -> Option<u16> {
        self.epoch
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.cipher_suite
    }

    fn has_security_attributes(&self) -> bool {
        self.session_id.is_some() || self.epoch.is_some() || self.cipher_suite.is_some()
    }
}

impl fmt::Display for EndpointContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer)?;
        if let Some(id) = &self.session_id {
            write!(f, " {}", id)?;
        }
        if let Some(epoch) = self.epoch {
            write!(f, " epoch {}", epoch)?;
        }
        Ok(())
    }
}

/// Decides whether a message may be sent under the actual session.
pub trait EndpointContextMatcher: Send + Sync {
    fn name(&self) -> &str;

    /// `actual` is `None` when no session is established yet.
    fn is_to_be_sent(&self, requested: &EndpointContext, actual: Option<&EndpointContext>) -> bool;
}

/// Only the session id must match, when one is requested.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelaxedContextMatcher;

impl EndpointContextMatcher for RelaxedContextMatcher {
    fn name(&self) -> &str {
        "relaxed"
    }

    fn is_to_be_sent(&self, requested: &EndpointContext, actual: Option<&EndpointContext>) -> bool {
        match (requested.session_id(), actual) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(id), Some(actual)) => actual.session_id() == Some(id),
        }
    }
}

/// Session id, epoch and cipher suite must all match, when requested.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictContextMatcher;

impl EndpointContextMatcher for StrictContextMatcher {
    fn name(&self) -> &str {
        "strict"
    }

    fn is_to_be_sent(&self, requested: &EndpointContext, actual: Option<&EndpointContext>) -> bool {
        let Some(actual) = actual else {
            return !requested.has_security_attributes();
        };
        matches(requested.session_id(), actual.session_id())
            && matches(requested.epoch(), actual.epoch())
            && matches(requested.cipher_suite(), actual.cipher_suite())
    }
}

fn matches<T: PartialEq>(requested: Option<T>, actual: Option<T>) -> bool {
    requested.is_none() || requested == actual
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.1:5684".parse().unwrap()
    }

    fn session(id: u8, epoch: u16) -> EndpointContext {
        EndpointContext::with_session(
            peer(),
            SessionId::try_new(&[id; 8]).unwrap(),
            epoch,
            Some(CipherSuite::ECDHE_PSK_AES128_GCM_SHA256),
        )
    }

    #[test]
    fn relaxed_ignores_epoch() {
        let m = RelaxedContextMatcher;
        assert!(m.is_to_be_sent(&session(1, 1), Some(&session(1, 2))));
        assert!(!m.is_to_be_sent(&session(1, 1), Some(&session(2, 1))));
        assert!(!m.is_to_be_sent(&session(1, 1), None));
        assert!(m.is_to_be_sent(&EndpointContext::new(peer()), None));
    }

    #[test]
    fn strict_requires_epoch() {
        let m = StrictContextMatcher;
        assert!(m.is_to_be_sent(&session(1, 1), Some(&session(1, 1))));
        assert!(!m.is_to_be_sent(&session(1, 1), Some(&session(1, 2))));
        assert!(m.is_to_be_sent(&EndpointContext::new(peer()), None));
        assert!(!m.is_to_be_sent(&session(1, 1), None));
    }
}
