//! Per-peer connection state.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::flight::Flight;
use crate::handshake::Handshaker;
use crate::outbound::PendingMessage;
use crate::session::{Session, SessionTicket};

/// A handshake in progress (or lingering after completion).
#[derive(Debug)]
pub struct OngoingHandshake {
    pub handshaker: Handshaker,
    /// The session being negotiated. `None` once it moved to
    /// [`Connection::established`] and the handshaker only lingers to answer
    /// a repeated final flight.
    pub session: Option<Session>,
    /// `message_seq` and bytes of the ClientHello that started a server side
    /// handshake, to recognize its retransmissions.
    pub started_by: Option<(u16, Vec<u8>)>,
}

impl OngoingHandshake {
    pub fn new(handshaker: Handshaker, session: Session) -> Self {
        OngoingHandshake {
            handshaker,
            session: Some(session),
            started_by: None,
        }
    }

    pub fn started_by(mut self, message_seq: u16, client_hello: &[u8]) -> Self {
        self.started_by = Some((message_seq, client_hello.to_vec()));
        self
    }

    pub fn is_started_by(&self, message_seq: u16, client_hello: &[u8]) -> bool {
        matches!(&self.started_by, Some((seq, raw)) if *seq == message_seq && raw == client_hello)
    }
}

/// Everything known about one peer.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    pub established: Option<Session>,
    pub handshake: Option<OngoingHandshake>,
    /// Resumable state of an earlier session, used by the next handshake.
    pub ticket: Option<SessionTicket>,
    pub resumption_required: bool,
    auto_resumption_timeout: Option<Duration>,
    last_message: Instant,
    pub pending_flight: Option<Flight>,
    /// Outbound messages waiting for the handshake.
    pub deferred: Vec<PendingMessage>,
    /// The address this peer used for the session being resumed, to be
    /// terminated once the resumption completes.
    pub superseded: Option<SocketAddr>,
}

impl Connection {
    pub fn new(peer: SocketAddr, auto_resumption_timeout: Option<Duration>, now: Instant) -> Self {
        Connection {
            peer,
            established: None,
            handshake: None,
            ticket: None,
            resumption_required: false,
            auto_resumption_timeout,
            last_message: now,
            pending_flight: None,
            deferred: Vec::new(),
            superseded: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn has_established_session(&self) -> bool {
        self.established.is_some()
    }

    pub fn has_ongoing_handshake(&self) -> bool {
        self.handshake
            .as_ref()
            .is_some_and(|h| h.handshaker.is_ongoing())
    }

    /// Record traffic with the peer.
    pub fn refresh(&mut self, now: Instant) {
        self.last_message = now;
    }

    /// Whether the peer was silent longer than the auto resumption timeout.
    pub fn is_auto_resumption_due(&self, now: Instant) -> bool {
        match self.auto_resumption_timeout {
            Some(timeout) => now.saturating_duration_since(self.last_message) >= timeout,
            None => false,
        }
    }

    /// The resumable state, from the established session or the last ticket.
    pub fn session_ticket(&self) -> Option<SessionTicket> {
        self.established
            .as_ref()
            .and_then(|s| s.ticket())
            .or_else(|| self.ticket.clone())
    }

    /// Mark the pending flight acknowledged and drop it.
    pub fn acknowledge_flight(&mut self) {
        if let Some(mut flight) = self.pending_flight.take() {
            flight.acknowledge();
        }
    }

    /// Replace the pending flight. A new flight answers the peer, so the
    /// previous one counts as acknowledged.
    pub fn replace_flight(&mut self, flight: Flight) {
        if let Some(mut old) = self.pending_flight.replace(flight) {
            old.acknowledge();
        }
    }

    /// Cancel the flight and drop the handshake, keeping any established session.
    pub fn cancel_handshake(&mut self) -> Vec<PendingMessage> {
        if let Some(mut flight) = self.pending_flight.take() {
            flight.abandon();
        }
        self.handshake = None;
        std::mem::take(&mut self.deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ExponentialBackoff;

    fn peer() -> SocketAddr {
        "127.0.0.1:5684".parse().unwrap()
    }

    #[test]
    fn auto_resumption_after_silence() {
        let now = Instant::now();
        let mut c = Connection::new(peer(), Some(Duration::from_secs(10)), now);
        assert!(!c.is_auto_resumption_due(now + Duration::from_secs(5)));
        assert!(c.is_auto_resumption_due(now + Duration::from_secs(10)));
        c.refresh(now + Duration::from_secs(8));
        assert!(!c.is_auto_resumption_due(now + Duration::from_secs(10)));

        let c = Connection::new(peer(), None, now);
        assert!(!c.is_auto_resumption_due(now + Duration::from_secs(3600)));
    }

    #[test]
    fn replacing_flight_acknowledges_previous() {
        let now = Instant::now();
        let mut c = Connection::new(peer(), None, now);
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), 3);
        let first = Flight::new(1, peer(), vec![], true, backoff.clone());
        let handle = first.handle();
        c.replace_flight(first);
        assert!(!handle.is_cancelled());

        c.replace_flight(Flight::new(2, peer(), vec![], true, backoff));
        assert!(handle.is_cancelled());
        assert_eq!(c.pending_flight.as_ref().unwrap().id(), 2);

        let second = c.pending_flight.as_ref().unwrap().handle();
        c.acknowledge_flight();
        assert!(second.is_cancelled());
        assert!(c.pending_flight.is_none());
    }

    #[test]
    fn started_by_matches_exact_hello() {
        let h = OngoingHandshake::new(Handshaker::server(peer(), 1), Session::new(peer()))
            .started_by(1, b"hello");
        assert!(h.is_started_by(1, b"hello"));
        assert!(!h.is_started_by(1, b"other"));
        assert!(!h.is_started_by(2, b"hello"));
    }
}
