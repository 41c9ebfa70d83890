//! Shared helpers for integration tests.
//!
//! Two engines talk through in-memory sinks. Timers are recorded instead of
//! run, and fired by hand.

#![allow(unused)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dtls_connector::{
    Alert, Config, ConfigBuilder, DatagramSink, EndpointContext, Engine, Error, FlightHandle,
    InboundMessage, OutboundMessage, RetransmitTimers, SessionEvent, StaticPskStore,
};
use parking_lot::Mutex;

pub const IDENTITY: &str = "device-1";
pub const KEY: [u8; 16] = *b"0123456789abcdef";

pub const CHANGE_CIPHER_SPEC: u8 = 20;
pub const ALERT: u8 = 21;
pub const HANDSHAKE: u8 = 22;
pub const APPLICATION_DATA: u8 = 23;

pub const CLIENT_HELLO: u8 = 1;
pub const HELLO_VERIFY_REQUEST: u8 = 3;

pub fn init_log() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// A config that knows `IDENTITY` in both roles.
pub fn config(seed: u64) -> ConfigBuilder {
    let psk = StaticPskStore::new()
        .with_key(IDENTITY, KEY)
        .with_client_identity(IDENTITY, KEY);
    Config::builder()
        .with_psk_store(Arc::new(psk))
        .retransmission_timeout(Duration::from_millis(100))
        .max_retransmissions(2)
        .rng_seed(seed)
}

/// Parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecHdr {
    pub ctype: u8,
    pub epoch: u16,
    pub seq: u64,
    /// First byte of the fragment, the handshake type of plaintext handshake records.
    pub first: Option<u8>,
}

pub fn parse_records(datagram: &[u8]) -> Vec<RecHdr> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 13 <= datagram.len() {
        let ctype = datagram[i];
        let epoch = u16::from_be_bytes([datagram[i + 3], datagram[i + 4]]);
        let mut seq = [0u8; 8];
        seq[2..].copy_from_slice(&datagram[i + 5..i + 11]);
        let len = u16::from_be_bytes([datagram[i + 11], datagram[i + 12]]) as usize;
        out.push(RecHdr {
            ctype,
            epoch,
            seq: u64::from_be_bytes(seq),
            first: datagram.get(i + 13).copied(),
        });
        i += 13 + len;
    }
    out
}

#[derive(Default)]
pub struct MemorySink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl MemorySink {
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }
}

impl DatagramSink for MemorySink {
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> std::io::Result<()> {
        self.sent.lock().push((peer, datagram.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct ManualTimers {
    scheduled: Mutex<Vec<(SocketAddr, FlightHandle, Duration)>>,
    cancelled_all: Mutex<bool>,
}

impl ManualTimers {
    pub fn take(&self) -> Vec<(SocketAddr, FlightHandle, Duration)> {
        std::mem::take(&mut *self.scheduled.lock())
    }

    pub fn was_cancelled(&self) -> bool {
        *self.cancelled_all.lock()
    }
}

impl RetransmitTimers for ManualTimers {
    fn schedule(&self, peer: SocketAddr, handle: FlightHandle, delay: Duration) {
        self.scheduled.lock().push((peer, handle, delay));
    }

    fn cancel_all(&self) {
        *self.cancelled_all.lock() = true;
        self.scheduled.lock().clear();
    }
}

pub struct Endpoint {
    pub addr: SocketAddr,
    pub engine: Arc<Engine>,
    pub sink: Arc<MemorySink>,
    pub timers: Arc<ManualTimers>,
    pub events: Arc<Mutex<Vec<SessionEvent>>>,
    pub received: Arc<Mutex<Vec<InboundMessage>>>,
    pub alerts: Arc<Mutex<Vec<(SocketAddr, Alert)>>>,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, config: Config) -> Self {
        let sink = Arc::new(MemorySink::default());
        let timers = Arc::new(ManualTimers::default());
        let engine = Arc::new(Engine::new(Arc::new(config), sink.clone(), timers.clone()));

        let events = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let alerts = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            engine.set_session_handler(move |e| events.lock().push(e));
            let received = received.clone();
            engine.set_message_handler(move |m| received.lock().push(m));
            let alerts = alerts.clone();
            engine.set_alert_handler(move |peer, alert| alerts.lock().push((peer, alert)));
        }

        Endpoint {
            addr,
            engine,
            sink,
            timers,
            events,
            received,
            alerts,
        }
    }

    /// The same endpoint as seen from another address, like after a NAT rebinding.
    pub fn rebound(&self, addr: SocketAddr) -> Endpoint {
        Endpoint {
            addr,
            engine: self.engine.clone(),
            sink: self.sink.clone(),
            timers: self.timers.clone(),
            events: self.events.clone(),
            received: self.received.clone(),
            alerts: self.alerts.clone(),
        }
    }

    /// Send `payload` to `peer`, collecting the outcome in the returned slot.
    pub fn send(&self, peer: SocketAddr, payload: &[u8]) -> Outcome {
        let outcome = Outcome::default();
        let slot = outcome.clone();
        self.engine.send(
            OutboundMessage::new(peer, payload.to_vec()).on_sent(move |r| {
                slot.0.lock().push(r);
            }),
        );
        outcome
    }

    pub fn established_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Established { .. }))
            .count()
    }

    pub fn failures(&self) -> Vec<Error> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Failed { error, .. } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.received.lock().iter().map(|m| m.payload.clone()).collect()
    }

    /// Fire every scheduled timer once.
    pub fn fire_timers(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        for (peer, handle, delay) in self.timers.take() {
            delays.push(delay);
            self.engine.handle_timeout(peer, handle);
        }
        delays
    }
}

/// Outcomes reported to a message's callback.
#[derive(Default, Clone)]
pub struct Outcome(pub Arc<Mutex<Vec<Result<EndpointContext, Error>>>>);

impl Outcome {
    pub fn results(&self) -> Vec<Result<EndpointContext, Error>> {
        self.0.lock().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.0.lock().as_slice(), [Ok(_)])
    }
}

pub fn pair() -> (Endpoint, Endpoint) {
    pair_with(config(1).build().unwrap(), config(2).build().unwrap())
}

pub fn pair_with(client: Config, server: Config) -> (Endpoint, Endpoint) {
    init_log();
    (
        Endpoint::new(addr(40001), client),
        Endpoint::new(addr(5684), server),
    )
}

/// Move the datagrams `from` sent to `to`. Returns how many were moved.
pub fn deliver(from: &Endpoint, to: &Endpoint) -> usize {
    let mut n = 0;
    for (peer, datagram) in from.sink.take() {
        if peer == to.addr {
            to.engine.receive_datagram(&datagram, from.addr);
            n += 1;
        }
    }
    n
}

/// Deliver back and forth until both sides are quiet.
pub fn shuttle(a: &Endpoint, b: &Endpoint) {
    for _ in 0..32 {
        let moved = deliver(a, b) + deliver(b, a);
        if moved == 0 {
            return;
        }
    }
    panic!("endpoints did not settle");
}

/// Client sends `payload` to server and both settle.
pub fn connect(client: &Endpoint, server: &Endpoint, payload: &[u8]) -> Outcome {
    let outcome = client.send(server.addr, payload);
    shuttle(client, server);
    outcome
}
