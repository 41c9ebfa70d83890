//! Flights of handshake records and their retransmission state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::Buf;
use crate::message::ContentType;
use crate::timer::ExponentialBackoff;

/// A record of a flight, before protection.
///
/// Flights are kept as plaintext and protected again on every
/// (re)transmission, so each copy gets a fresh sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutRecord {
    pub content_type: ContentType,
    pub epoch: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightState {
    /// Sent, waiting for the peer's next flight.
    Pending,
    /// Resent at least once.
    Retransmitting,
    /// The peer's response arrived.
    Acknowledged,
    /// Replaced by a newer flight of the same handshake.
    Superseded,
    /// Retry budget exhausted.
    Abandoned,
}

/// What the retransmission timer holds on to.
///
/// The shared flag lets the timer thread skip a cancelled flight without
/// taking the connection lock.
#[derive(Debug, Clone)]
pub struct FlightHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl FlightHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// The latest flight sent to a peer.
#[derive(Debug)]
pub struct Flight {
    id: u64,
    peer: SocketAddr,
    records: Vec<OutRecord>,
    retransmission_needed: bool,
    backoff: ExponentialBackoff,
    state: FlightState,
    cancelled: Arc<AtomicBool>,
}

impl Flight {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        records: Vec<OutRecord>,
        retransmission_needed: bool,
        backoff: ExponentialBackoff,
    ) -> Self {
        Flight {
            id,
            peer,
            records,
            retransmission_needed,
            backoff,
            state: FlightState::Pending,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn records(&self) -> &[OutRecord] {
        &self.records
    }

    /// Whether this flight is resent on timeout. The last flight of a
    /// handshake is only resent when the peer repeats its own flight.
    pub fn is_retransmission_needed(&self) -> bool {
        self.retransmission_needed
    }

    pub fn state(&self) -> FlightState {
        self.state
    }

    pub fn handle(&self) -> FlightHandle {
        FlightHandle {
            id: self.id,
            cancelled: self.cancelled.clone(),
        }
    }

    /// Current timeout, to schedule the next expiry with.
    pub fn timeout(&self) -> std::time::Duration {
        self.backoff.rto()
    }

    /// Retransmissions done so far.
    pub fn tries(&self) -> usize {
        self.backoff.attempts()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the timer for `handle` may still act on this flight.
    pub fn is_live(&self, handle: &FlightHandle) -> bool {
        handle.id == self.id
            && !self.is_cancelled()
            && matches!(self.state, FlightState::Pending | FlightState::Retransmitting)
    }

    /// Account for one retransmission. Returns false once the budget is spent.
    pub fn retransmit(&mut self) -> bool {
        if !self.backoff.can_retry() {
            return false;
        }
        self.backoff.attempt();
        self.state = FlightState::Retransmitting;
        true
    }

    fn finish(&mut self, state: FlightState) {
        self.cancelled.store(true, Ordering::Release);
        if matches!(self.state, FlightState::Pending | FlightState::Retransmitting) {
            self.state = state;
        }
    }

    pub fn acknowledge(&mut self) {
        self.finish(FlightState::Acknowledged);
    }

    pub fn supersede(&mut self) {
        self.finish(FlightState::Superseded);
    }

    pub fn abandon(&mut self) {
        self.finish(FlightState::Abandoned);
    }
}

/// Pack serialized records into datagrams of at most `max_datagram_size`.
///
/// A record that does not fit an empty datagram is dropped.
pub fn pack_datagrams(records: Vec<Buf>, max_datagram_size: usize) -> Vec<Buf> {
    let mut datagrams = Vec::new();
    let mut current = Buf::new();

    for record in records {
        if record.len() > max_datagram_size {
            info!(
                "Record of {} bytes exceeds max datagram size [{}], discarding",
                record.len(),
                max_datagram_size
            );
            continue;
        }
        if current.len() + record.len() > max_datagram_size {
            datagrams.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&record);
    }

    if !current.is_empty() {
        datagrams.push(current);
    }
    datagrams
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn flight(retries: usize) -> Flight {
        Flight::new(
            1,
            "127.0.0.1:1".parse().unwrap(),
            vec![],
            true,
            ExponentialBackoff::new(Duration::from_millis(100), retries),
        )
    }

    #[test]
    fn retransmit_until_budget_spent() {
        let mut f = flight(2);
        assert_eq!(f.timeout(), Duration::from_millis(100));
        assert!(f.retransmit());
        assert_eq!(f.timeout(), Duration::from_millis(200));
        assert!(f.retransmit());
        assert_eq!(f.tries(), 2);
        assert!(!f.retransmit());
        assert_eq!(f.state(), FlightState::Retransmitting);
    }

    #[test]
    fn cancelled_handle_is_not_live() {
        let mut f = flight(2);
        let handle = f.handle();
        assert!(f.is_live(&handle));
        f.supersede();
        assert!(handle.is_cancelled());
        assert!(!f.is_live(&handle));
        assert_eq!(f.state(), FlightState::Superseded);

        // Terminal state sticks
        f.acknowledge();
        assert_eq!(f.state(), FlightState::Superseded);
    }

    #[test]
    fn packs_records_into_datagrams() {
        let records = vec![
            Buf::from_slice(&[1; 40]),
            Buf::from_slice(&[2; 40]),
            Buf::from_slice(&[3; 200]),
            Buf::from_slice(&[4; 30]),
        ];
        let datagrams = pack_datagrams(records, 100);
        assert_eq!(datagrams.len(), 2);
        assert_eq!(datagrams[0].len(), 80);
        assert_eq!(datagrams[1].len(), 30);
    }
}
