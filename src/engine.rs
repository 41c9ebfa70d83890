use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::buffer::Buf;
use crate::config::DEFAULT_MTU;
use crate::connection::{Connection, OngoingHandshake};
use crate::context::{EndpointContext, EndpointContextMatcher, RelaxedContextMatcher};
use crate::cookie::{CookieCheck, CookieGenerator};
use crate::flight::{pack_datagrams, Flight, FlightHandle, OutRecord};
use crate::handshake::{HandshakeEnv, Handshaker, Incoming, Outgoing, Step};
use crate::message::{Alert, AlertDescription, Body, ClientHello, ContentType, Cookie};
use crate::message::{HandshakeMessage, HelloVerifyRequest, ProtocolVersion, Record};
use crate::message::MAX_PLAINTEXT_FRAGMENT_LENGTH;
use crate::outbound::{InboundMessage, OutboundGate, OutboundMessage, PendingMessage};
use crate::rng::SeededRng;
use crate::session::{Session, SessionTicket, HEADER_LENGTH};
use crate::store::{ConnectionStore, SharedConnection};
use crate::timer::ExponentialBackoff;
use crate::{Config, Error, HandshakeFailure};

/// Where datagrams go.
pub trait DatagramSink: Send + Sync {
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<()>;
}

impl DatagramSink for UdpSocket {
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, datagram, peer).map(|_| ())
    }
}

/// Retransmission timers.
///
/// When a timer fires, [`Engine::handle_timeout`] must be called with the
/// peer and handle it was scheduled with, on the peer's stripe.
pub trait RetransmitTimers: Send + Sync {
    fn schedule(&self, peer: SocketAddr, handle: FlightHandle, delay: Duration);

    fn cancel_all(&self);
}

/// Outcome of a handshake, as reported to the session handler.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Established {
        peer: SocketAddr,
        context: EndpointContext,
    },
    Failed {
        peer: SocketAddr,
        error: Error,
    },
}

type Handler<T> = RwLock<Option<Arc<dyn Fn(T) + Send + Sync>>>;

#[derive(Default)]
struct Handlers {
    message: Handler<InboundMessage>,
    alert: Handler<(SocketAddr, Alert)>,
    session: Handler<SessionEvent>,
}

fn call<T>(handler: &Handler<T>, value: T) {
    // Cloned out, so a handler may replace handlers
    let handler = handler.read().clone();
    if let Some(handler) = handler {
        handler(value);
    }
}

/// Work that must wait until the connection lock is released.
///
/// Callbacks into the application may send, and other connections may only
/// be locked, once no connection lock is held.
#[derive(Default)]
struct Effects {
    completions: Vec<(PendingMessage, Result<EndpointContext, Error>)>,
    delivered: Vec<InboundMessage>,
    alerts: Vec<(SocketAddr, Alert)>,
    events: Vec<SessionEvent>,
    terminate: Vec<SocketAddr>,
}

impl Effects {
    fn complete(&mut self, pending: PendingMessage, result: Result<EndpointContext, Error>) {
        self.completions.push((pending, result));
    }

    fn fail_all(&mut self, pending: Vec<PendingMessage>, error: &Error) {
        for p in pending {
            self.complete(p, Err(error.clone()));
        }
    }

    fn run(self, engine: &Engine) {
        for peer in self.terminate {
            engine.terminate_peer(peer, Error::Closed);
        }
        for (pending, result) in self.completions {
            pending.complete(result);
        }
        for event in self.events {
            call(&engine.handlers.session, event);
        }
        for alert in self.alerts {
            call(&engine.handlers.alert, alert);
        }
        for message in self.delivered {
            call(&engine.handlers.message, message);
        }
    }
}

/// The connector core.
///
/// Routes records to connections, drives their handshakes, retransmits
/// flights and sends application data. The engine does no I/O of its own
/// beyond the [`DatagramSink`] and spawns no threads: the caller serializes
/// calls per peer (see [`StripedExecutor`](crate::StripedExecutor)) and
/// forwards fired timers to [`handle_timeout`](Self::handle_timeout).
///
/// Locking: at most one connection lock is held at any time. Everything
/// that needs another connection, or calls back into the application, runs
/// after the lock is released.
pub struct Engine {
    config: Arc<Config>,
    store: Arc<ConnectionStore>,
    cookies: CookieGenerator,
    gate: OutboundGate,
    matcher: RwLock<Arc<dyn EndpointContextMatcher>>,
    sink: Arc<dyn DatagramSink>,
    timers: Arc<dyn RetransmitTimers>,
    rng: Mutex<SeededRng>,
    next_flight_id: AtomicU64,
    running: AtomicBool,
    handlers: Handlers,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        sink: Arc<dyn DatagramSink>,
        timers: Arc<dyn RetransmitTimers>,
    ) -> Self {
        let store = Arc::new(ConnectionStore::new(
            config.max_connections(),
            config.stale_connection_threshold(),
            config.session_cache(),
        ));
        Self::with_store(config, store, sink, timers)
    }

    /// An engine over an existing store, to keep connections across restarts.
    pub fn with_store(
        config: Arc<Config>,
        store: Arc<ConnectionStore>,
        sink: Arc<dyn DatagramSink>,
        timers: Arc<dyn RetransmitTimers>,
    ) -> Self {
        let now = Instant::now();
        Engine {
            cookies: CookieGenerator::new(config.cookie_secret_lifetime(), config.rng_seed(), now),
            gate: OutboundGate::new(config.outbound_message_buffer_size()),
            matcher: RwLock::new(Arc::new(RelaxedContextMatcher)),
            rng: Mutex::new(SeededRng::new(config.rng_seed())),
            next_flight_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            handlers: Handlers::default(),
            config,
            store,
            sink,
            timers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<ConnectionStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Messages accepted and not yet completed.
    pub fn pending_messages(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn mtu(&self) -> usize {
        self.config.mtu().unwrap_or(DEFAULT_MTU)
    }

    pub fn set_message_handler(&self, handler: impl Fn(InboundMessage) + Send + Sync + 'static) {
        *self.handlers.message.write() = Some(Arc::new(handler));
    }

    /// Called for every alert received, whether or not it ends the connection.
    pub fn set_alert_handler(&self, handler: impl Fn(SocketAddr, Alert) + Send + Sync + 'static) {
        *self.handlers.alert.write() = Some(Arc::new(move |(peer, alert): (SocketAddr, Alert)| {
            handler(peer, alert)
        }));
    }

    pub fn set_session_handler(&self, handler: impl Fn(SessionEvent) + Send + Sync + 'static) {
        *self.handlers.session.write() = Some(Arc::new(handler));
    }

    pub fn set_context_matcher(&self, matcher: Arc<dyn EndpointContextMatcher>) {
        *self.matcher.write() = matcher;
    }

    fn env(&self) -> HandshakeEnv<'_> {
        HandshakeEnv {
            config: &self.config,
            rng: &self.rng,
        }
    }

    fn new_connection(&self, peer: SocketAddr, now: Instant) -> SharedConnection {
        Arc::new(Mutex::new(Connection::new(
            peer,
            self.config.auto_resumption_timeout(),
            now,
        )))
    }

    // Inbound

    /// Process every record in `datagram`.
    pub fn receive_datagram(&self, datagram: &[u8], peer: SocketAddr) {
        for record in Record::parse_datagram(datagram) {
            self.process_record(record, peer);
        }
    }

    /// Process one record from `peer`.
    ///
    /// A panic while processing tears down the connection with `peer`
    /// and nothing else.
    pub fn process_record(&self, record: Record, peer: SocketAddr) {
        if !self.is_running() {
            trace!("Not running, discarding record from {}", peer);
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.route_record(record, peer)));
        if result.is_err() {
            warn!("Fault processing record from {}, terminating connection", peer);
            self.terminate_on_fault(peer);
        }
    }

    fn route_record(&self, record: Record, peer: SocketAddr) {
        trace!(
            "Received {:?} epoch {} seq {} ({} bytes) from {}",
            record.content_type,
            record.epoch,
            record.sequence_number,
            record.fragment.len(),
            peer
        );
        match record.content_type {
            ContentType::ApplicationData => self.process_application_data(record, peer),
            ContentType::Alert => self.process_alert(record, peer),
            ContentType::ChangeCipherSpec => self.process_change_cipher_spec(record, peer),
            ContentType::Handshake => self.process_handshake(record, peer),
            ContentType::Unknown(t) => {
                debug!("Discarding record of unsupported type {} from {}", t, peer)
            }
        }
    }

    fn process_application_data(&self, record: Record, peer: SocketAddr) {
        let now = Instant::now();
        let Some(connection) = self.store.get(peer, now) else {
            debug!("Discarding application data from {} without connection", peer);
            return;
        };

        let mut effects = Effects::default();
        {
            let mut guard = connection.lock();
            let conn = &mut *guard;
            let Some(session) = conn.established.as_mut() else {
                debug!("Discarding application data from {} without session", peer);
                return;
            };
            let Some(payload) = open_record(session, &record) else {
                return;
            };
            let context = session.context();

            // The peer has our keys, so our final flight arrived
            if conn.handshake.as_ref().is_some_and(|h| h.session.is_none()) {
                trace!("Handshake with {} completed by application data", peer);
                conn.handshake = None;
                conn.acknowledge_flight();
            }
            conn.refresh(now);
            effects.delivered.push(InboundMessage {
                peer,
                payload,
                context,
            });
        }
        effects.run(self);
    }

    fn process_alert(&self, record: Record, peer: SocketAddr) {
        let Some(connection) = self.store.get(peer, Instant::now()) else {
            debug!("Discarding alert from {} without connection", peer);
            return;
        };

        let mut effects = Effects::default();
        {
            let mut guard = connection.lock();
            let conn = &mut *guard;
            let Some(session) = session_for_epoch(conn, record.epoch) else {
                debug!("Discarding alert of epoch {} from {}", record.epoch, peer);
                return;
            };
            let Some(plaintext) = open_record(session, &record) else {
                return;
            };
            let Ok((_, alert)) = Alert::parse(&plaintext) else {
                debug!("Discarding malformed alert from {}", peer);
                return;
            };
            effects.alerts.push((peer, alert));

            if alert.description == AlertDescription::CloseNotify {
                debug!("Peer {} closed the connection", peer);
                self.send_alert(session, Alert::close_notify());
                self.terminate(conn, &connection, Error::Closed, &mut effects);
            } else if alert.is_fatal() {
                info!("Fatal alert {:?} from {}", alert.description, peer);
                let failure = HandshakeFailure::fatal(alert.description, "Fatal alert received");
                self.terminate(conn, &connection, Error::Handshake(failure), &mut effects);
            } else {
                debug!("Warning alert {:?} from {}", alert.description, peer);
            }
        }
        effects.run(self);
    }

    fn process_change_cipher_spec(&self, record: Record, peer: SocketAddr) {
        let Some(connection) = self.store.get(peer, Instant::now()) else {
            debug!("Discarding ChangeCipherSpec from {} without connection", peer);
            return;
        };

        let mut effects = Effects::default();
        {
            let mut guard = connection.lock();
            let conn = &mut *guard;
            let session = conn
                .handshake
                .as_mut()
                .and_then(|h| h.session.as_mut())
                .filter(|s| s.read_epoch() == record.epoch);
            let Some(session) = session else {
                debug!("Discarding ChangeCipherSpec from {} outside handshake", peer);
                return;
            };
            if open_record(session, &record).as_deref() != Some(&[1][..]) {
                debug!("Discarding malformed ChangeCipherSpec from {}", peer);
                return;
            }
            self.drive(conn, &connection, Incoming::ChangeCipherSpec, &mut effects);
        }
        effects.run(self);
    }

    fn process_handshake(&self, record: Record, peer: SocketAddr) {
        let existing = self.store.get(peer, Instant::now());

        if record.is_new_client_hello() {
            let Some(message) = parse_message(&record.fragment, peer) else {
                return;
            };
            if let Body::ClientHello(hello) = &message.body {
                self.process_client_hello(&record, &message, hello, peer, existing);
                return;
            }
        }

        let Some(connection) = existing else {
            debug!(
                "Discarding handshake record (epoch {}) from {} without connection",
                record.epoch, peer
            );
            return;
        };

        let mut effects = Effects::default();
        {
            let mut guard = connection.lock();
            let conn = &mut *guard;

            if handshake_read_epoch(conn) == Some(record.epoch) {
                let Some(session) = session_for_epoch(conn, record.epoch) else {
                    return;
                };
                let Some(plaintext) = open_record(session, &record) else {
                    return;
                };
                let Some(message) = parse_message(&plaintext, peer) else {
                    return;
                };
                if matches!(message.body, Body::HelloRequest) {
                    debug!("Ignoring HelloRequest from {} during handshake", peer);
                    return;
                }
                let incoming = Incoming::Message {
                    message: &message,
                    raw: &plaintext,
                };
                self.drive(conn, &connection, incoming, &mut effects);
            } else if let Some(session) = conn
                .established
                .as_mut()
                .filter(|s| s.read_epoch() == record.epoch)
            {
                let Some(plaintext) = open_record(session, &record) else {
                    return;
                };
                let Some(message) = parse_message(&plaintext, peer) else {
                    return;
                };
                match message.body {
                    Body::ClientHello(_) | Body::HelloRequest => {
                        debug!("Refusing renegotiation with {}", peer);
                        let alert = Alert::warning(AlertDescription::NoRenegotiation);
                        self.send_alert(session, alert);
                    }
                    _ => debug!(
                        "Discarding {:?} from {} under established session",
                        message.handshake_type(),
                        peer
                    ),
                }
            } else {
                debug!(
                    "Discarding handshake record of epoch {} from {}",
                    record.epoch, peer
                );
            }
        }
        effects.run(self);
    }

    fn process_client_hello(
        &self,
        record: &Record,
        message: &HandshakeMessage,
        hello: &ClientHello,
        peer: SocketAddr,
        existing: Option<SharedConnection>,
    ) {
        match self.cookies.verify(peer, hello, Instant::now()) {
            Ok(CookieCheck::Valid) => {}
            Ok(CookieCheck::Expected(expected)) => {
                self.send_hello_verify_request(record, message, expected, peer);
                return;
            }
            Err(e) => {
                warn!("Cannot check cookie of {}: {}", peer, e);
                return;
            }
        }

        if let Some(connection) = &existing {
            let mut effects = Effects::default();
            let mut guard = connection.lock();
            let conn = &mut *guard;
            let repeated = conn
                .handshake
                .as_ref()
                .is_some_and(|h| h.is_started_by(message.message_seq, &record.fragment));
            if repeated {
                let incoming = Incoming::Message {
                    message,
                    raw: &record.fragment,
                };
                self.drive(conn, connection, incoming, &mut effects);
                drop(guard);
                effects.run(self);
                return;
            }
        }

        if hello.session_id.is_empty() {
            self.start_server_handshake(record, message, peer, existing, None);
            return;
        }

        // Resumption: the session may live on at another address
        let id = hello.session_id;
        let found = self
            .store
            .find(&id)
            .map(|c| {
                let conn = c.lock();
                (Some(conn.peer()), conn.session_ticket())
            })
            .or_else(|| self.store.cached_ticket(&id).map(|t| (None, Some(t))));

        match found {
            Some((previous_peer, Some(ticket))) if *ticket.session_id() == id => {
                debug!("Resuming session {} with {}", id, peer);
                let superseded = previous_peer.filter(|p| *p != peer);
                self.start_server_handshake(record, message, peer, existing, Some((ticket, superseded)));
            }
            _ => {
                debug!("Session {} of {} not found, full handshake", id, peer);
                self.start_server_handshake(record, message, peer, existing, None);
            }
        }
    }

    fn start_server_handshake(
        &self,
        record: &Record,
        message: &HandshakeMessage,
        peer: SocketAddr,
        existing: Option<SharedConnection>,
        resume: Option<(SessionTicket, Option<SocketAddr>)>,
    ) {
        if existing.is_some() {
            self.terminate_peer(peer, Error::Closed);
        }

        let now = Instant::now();
        let connection = self.new_connection(peer, now);
        if !self.store.put(peer, connection.clone(), now) {
            warn!("Connection store exhausted, dropping ClientHello from {}", peer);
            return;
        }

        let mut effects = Effects::default();
        {
            let mut guard = connection.lock();
            let conn = &mut *guard;
            let handshaker = match resume {
                Some((ticket, superseded)) => {
                    conn.superseded = superseded;
                    Handshaker::resuming_server(peer, message.message_seq, ticket)
                }
                None => Handshaker::server(peer, message.message_seq),
            };
            // Continues the record sequence of the HelloVerifyRequest
            let session = Session::with_initial_sequence(peer, record.sequence_number);
            conn.handshake = Some(
                OngoingHandshake::new(handshaker, session)
                    .started_by(message.message_seq, &record.fragment),
            );

            let incoming = Incoming::Message {
                message,
                raw: &record.fragment,
            };
            self.drive(conn, &connection, incoming, &mut effects);
        }
        effects.run(self);
    }

    fn send_hello_verify_request(
        &self,
        client_hello: &Record,
        message: &HandshakeMessage,
        cookie: Cookie,
        peer: SocketAddr,
    ) {
        trace!("Sending HelloVerifyRequest to {}", peer);
        let hvr = HandshakeMessage::new(
            message.message_seq,
            Body::HelloVerifyRequest(HelloVerifyRequest {
                server_version: ProtocolVersion::DTLS1_2,
                cookie,
            }),
        );
        // Stateless: reuse the ClientHello's record sequence number
        let record = Record {
            content_type: ContentType::Handshake,
            version: ProtocolVersion::DTLS1_2,
            epoch: 0,
            sequence_number: client_hello.sequence_number,
            fragment: hvr.to_bytes(),
        };
        self.send_record(&record, peer);
    }

    // Handshake orchestration

    /// Hand `incoming` to the connection's handshake and act on the result.
    fn drive(
        &self,
        conn: &mut Connection,
        shared: &SharedConnection,
        incoming: Incoming<'_>,
        effects: &mut Effects,
    ) {
        let env = self.env();
        let result = {
            let established = conn.established.as_mut();
            let Some(handshake) = conn.handshake.as_mut() else {
                return;
            };
            let Some(session) = handshake.session.as_mut().or(established) else {
                return;
            };
            handshake.handshaker.process(incoming, session, &env)
        };

        let result = match result {
            Ok(step) => self.apply_step(conn, step, effects),
            Err(failure) => Err(Error::Handshake(failure)),
        };
        if let Err(error) = result {
            self.handshake_failed(conn, shared, error, effects);
        }
    }

    /// Start the client side handshake set up on `conn`.
    fn start_handshake(&self, conn: &mut Connection, shared: &SharedConnection, effects: &mut Effects) {
        let env = self.env();
        let result = {
            let Some(handshake) = conn.handshake.as_mut() else {
                return;
            };
            let Some(session) = handshake.session.as_mut() else {
                return;
            };
            handshake.handshaker.start(session, &env)
        };
        let result = match result {
            Ok(step) => self.apply_step(conn, step, effects),
            Err(failure) => Err(Error::Handshake(failure)),
        };
        if let Err(error) = result {
            self.handshake_failed(conn, shared, error, effects);
        }
    }

    fn apply_step(&self, conn: &mut Connection, step: Step, effects: &mut Effects) -> Result<(), Error> {
        let established = step.is_established();
        match step.outgoing {
            Outgoing::Nothing => {}
            Outgoing::ResendLast => self.resend_flight(conn)?,
            Outgoing::Flight { records, retransmit } => self.send_flight(conn, records, retransmit)?,
        }
        if established {
            self.handshake_completed(conn, effects);
        }
        Ok(())
    }

    fn send_flight(&self, conn: &mut Connection, records: Vec<OutRecord>, retransmit: bool) -> Result<(), Error> {
        let peer = conn.peer();
        let session = current_session(conn).ok_or(Error::Closed)?;
        self.transmit(session, &records)?;

        let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
        let backoff = ExponentialBackoff::new(
            self.config.retransmission_timeout(),
            self.config.max_retransmissions(),
        );
        let flight = Flight::new(id, peer, records, retransmit, backoff);
        debug!(
            "Sent flight {} ({} records) to {}",
            id,
            flight.records().len(),
            peer
        );
        if retransmit {
            self.timers.schedule(peer, flight.handle(), flight.timeout());
        }
        conn.replace_flight(flight);
        Ok(())
    }

    fn resend_flight(&self, conn: &mut Connection) -> Result<(), Error> {
        let Some(records) = conn.pending_flight.as_ref().map(|f| f.records().to_vec()) else {
            return Ok(());
        };
        debug!("Resending last flight to {}", conn.peer());
        let session = current_session(conn).ok_or(Error::Closed)?;
        self.transmit(session, &records)
    }

    /// Protect `records` with fresh sequence numbers and send them in as few
    /// datagrams as fit.
    fn transmit(&self, session: &mut Session, records: &[OutRecord]) -> Result<(), Error> {
        let mut serialized = Vec::with_capacity(records.len());
        for out in records {
            let record = session.protect(out.content_type, out.epoch, &out.payload)?;
            let mut buf = Buf::new();
            record.serialize(&mut buf);
            serialized.push(buf);
        }
        let peer = session.peer();
        for datagram in pack_datagrams(serialized, session.max_datagram_size(self.mtu())) {
            if let Err(e) = self.sink.send_to(&datagram, peer) {
                // Retransmission covers a lost flight
                warn!("Failed to send flight to {}: {}", peer, e);
            }
        }
        Ok(())
    }

    fn handshake_completed(&self, conn: &mut Connection, effects: &mut Effects) {
        let peer = conn.peer();
        let Some(mut handshake) = conn.handshake.take() else {
            return;
        };
        let Some(session) = handshake.session.take() else {
            return;
        };

        // A final flight is kept until the peer shows it arrived
        let lingers = conn
            .pending_flight
            .as_ref()
            .is_some_and(|f| !f.is_retransmission_needed());
        if lingers {
            conn.handshake = Some(handshake);
        } else {
            conn.acknowledge_flight();
        }

        let context = session.context();
        let ticket = session.ticket();
        info!(
            "Session {} established with {} ({})",
            session.id(),
            peer,
            if lingers { "awaiting peer" } else { "complete" }
        );
        conn.established = Some(session);
        conn.ticket = ticket.clone();
        conn.resumption_required = false;
        conn.refresh(Instant::now());
        self.store.session_established(peer, ticket);

        effects.events.push(SessionEvent::Established {
            peer,
            context,
        });
        for pending in std::mem::take(&mut conn.deferred) {
            self.send_under_session(conn, pending, effects);
        }
        if let Some(old) = conn.superseded.take() {
            debug!("Session moved from {} to {}", old, peer);
            effects.terminate.push(old);
        }
    }

    fn handshake_failed(
        &self,
        conn: &mut Connection,
        shared: &SharedConnection,
        error: Error,
        effects: &mut Effects,
    ) {
        let peer = conn.peer();
        if let Error::Handshake(failure) = &error {
            if !failure.is_fatal() {
                debug!("Discarding message from {}: {}", peer, failure);
                return;
            }
            if failure.alert().description == AlertDescription::UnknownPskIdentity {
                // No alert, so the identity cannot be probed
                debug!("Discarding message from {}: {}", peer, failure);
                return;
            }
        }

        let alert = match &error {
            Error::Handshake(failure) => Some(failure.alert()),
            Error::Timeout(_) => None,
            _ => Some(Alert::fatal(AlertDescription::InternalError)),
        };
        if let Some(alert) = alert {
            if let Some(session) = current_session(conn) {
                self.send_alert(session, alert);
            }
        }

        info!("Handshake with {} failed: {}", peer, error);
        let deferred = conn.cancel_handshake();
        effects.fail_all(deferred, &error);
        if conn.established.is_none() {
            self.store.remove(peer, shared);
        }
        effects.events.push(SessionEvent::Failed { peer, error });
    }

    /// Remove the connection, failing its handshake and deferred messages with `error`.
    fn terminate(
        &self,
        conn: &mut Connection,
        shared: &SharedConnection,
        error: Error,
        effects: &mut Effects,
    ) {
        let peer = conn.peer();
        if conn.has_ongoing_handshake() {
            effects.events.push(SessionEvent::Failed {
                peer,
                error: error.clone(),
            });
        }
        let deferred = conn.cancel_handshake();
        effects.fail_all(deferred, &error);
        conn.established = None;
        self.store.remove(peer, shared);
    }

    fn terminate_peer(&self, peer: SocketAddr, error: Error) {
        let Some(connection) = self.store.get(peer, Instant::now()) else {
            return;
        };
        let mut effects = Effects::default();
        {
            let mut guard = connection.lock();
            self.terminate(&mut guard, &connection, error, &mut effects);
        }
        effects.run(self);
    }

    fn terminate_on_fault(&self, peer: SocketAddr) {
        let Some(connection) = self.store.get(peer, Instant::now()) else {
            return;
        };
        let mut effects = Effects::default();
        {
            let mut guard = connection.lock();
            let conn = &mut *guard;
            if let Some(session) = current_session(conn) {
                self.send_alert(session, Alert::fatal(AlertDescription::InternalError));
            }
            let failure = HandshakeFailure::fatal(AlertDescription::InternalError, "Processing fault");
            self.terminate(conn, &connection, Error::Handshake(failure), &mut effects);
        }
        effects.run(self);
    }

    fn send_alert(&self, session: &mut Session, alert: Alert) {
        let epoch = session.write_epoch();
        match session.protect(ContentType::Alert, epoch, &alert.to_bytes()) {
            Ok(record) => self.send_record(&record, session.peer()),
            Err(e) => debug!("Cannot protect alert for {}: {}", session.peer(), e),
        }
    }

    fn send_record(&self, record: &Record, peer: SocketAddr) {
        let mut buf = Buf::new();
        record.serialize(&mut buf);
        if let Err(e) = self.sink.send_to(&buf, peer) {
            warn!("Failed to send {:?} to {}: {}", record.content_type, peer, e);
        }
    }

    // Retransmission

    /// A retransmission timer for `peer` fired.
    pub fn handle_timeout(&self, peer: SocketAddr, handle: FlightHandle) {
        if handle.is_cancelled() || !self.is_running() {
            return;
        }
        let Some(connection) = self.store.get(peer, Instant::now()) else {
            return;
        };

        let mut effects = Effects::default();
        {
            let mut guard = connection.lock();
            let conn = &mut *guard;
            let Some(flight) = conn.pending_flight.as_mut().filter(|f| f.is_live(&handle)) else {
                trace!("Timer for flight {} of {} is stale", handle.id(), peer);
                return;
            };

            if flight.retransmit() {
                debug!(
                    "Retransmitting flight {} to {} (try {})",
                    flight.id(),
                    peer,
                    flight.tries()
                );
                let next = (flight.handle(), flight.timeout());
                let records = flight.records().to_vec();
                let result = match current_session(conn) {
                    Some(session) => self.transmit(session, &records),
                    None => Err(Error::Closed),
                };
                match result {
                    Ok(()) => self.timers.schedule(peer, next.0, next.1),
                    Err(e) => self.handshake_failed(conn, &connection, e, &mut effects),
                }
            } else {
                flight.abandon();
                info!("Flight {} to {} timed out", handle.id(), peer);
                let error = Error::Timeout("handshake flight");
                self.handshake_failed(conn, &connection, error, &mut effects);
            }
        }
        effects.run(self);
    }

    // Outbound

    /// Admit a message against size and backpressure limits.
    ///
    /// A message that is not admitted has its callback called right away.
    pub fn admit(&self, message: OutboundMessage) -> Option<PendingMessage> {
        if !self.is_running() {
            message.fail(Error::NotRunning);
            return None;
        }
        let len = message.payload().len();
        if len > MAX_PLAINTEXT_FRAGMENT_LENGTH {
            message.fail(Error::MessageTooLarge(len));
            return None;
        }
        match self.gate.try_acquire() {
            Some(permit) => Some(PendingMessage::new(message, permit)),
            None => {
                warn!(
                    "Outbound message overflow, {} pending, dropping message to {}",
                    self.gate.in_flight(),
                    message.peer()
                );
                message.fail(Error::OutboundOverflow);
                None
            }
        }
    }

    /// Admit and send `message`.
    pub fn send(&self, message: OutboundMessage) {
        if let Some(pending) = self.admit(message) {
            self.send_pending(pending);
        }
    }

    /// Send an admitted message, starting or resuming a handshake if needed.
    pub fn send_pending(&self, pending: PendingMessage) {
        if !self.is_running() {
            pending.fail(Error::NotRunning);
            return;
        }
        let peer = pending.peer();
        let now = Instant::now();

        let connection = match self.store.get(peer, now) {
            Some(connection) => connection,
            None => {
                let connection = self.new_connection(peer, now);
                if !self.store.put(peer, connection.clone(), now) {
                    warn!("Connection store exhausted, cannot connect to {}", peer);
                    pending.fail(Error::ConnectionStoreExhausted);
                    return;
                }
                connection
            }
        };

        let mut effects = Effects::default();
        let mut guard = connection.lock();
        let conn = &mut *guard;

        if conn.has_established_session() && conn.is_auto_resumption_due(now) {
            debug!("{} idle beyond auto resumption timeout", peer);
            conn.resumption_required = true;
        }

        if conn.resumption_required {
            let ticket = conn.session_ticket();
            let mut deferred = conn.cancel_handshake();
            if let Some(mut flight) = conn.pending_flight.take() {
                flight.supersede();
            }
            conn.resumption_required = false;
            drop(guard);
            deferred.push(pending);
            self.start_client_connection(peer, ticket, deferred, &mut effects);
            effects.run(self);
            return;
        }

        if conn.has_established_session() {
            self.send_under_session(conn, pending, &mut effects);
        } else if let Some(requested) = pending.context().filter(|c| !self.matcher.read().is_to_be_sent(c, None)) {
            warn!("No session with {} matching {}, dropping message", peer, requested);
            effects.complete(pending, Err(Error::EndpointMismatch));
        } else if conn.has_ongoing_handshake() {
            trace!("Deferring message to {} until handshake completes", peer);
            conn.deferred.push(pending);
        } else {
            let handshaker = match conn.ticket.clone() {
                Some(ticket) => Handshaker::resuming_client(peer, ticket),
                None => Handshaker::client(peer),
            };
            conn.handshake = Some(OngoingHandshake::new(handshaker, Session::new(peer)));
            conn.deferred.push(pending);
            self.start_handshake(conn, &connection, &mut effects);
        }
        drop(guard);
        effects.run(self);
    }

    /// Replace the connection with `peer` by a new one running a client
    /// handshake, resuming `ticket` if there is one.
    fn start_client_connection(
        &self,
        peer: SocketAddr,
        ticket: Option<SessionTicket>,
        deferred: Vec<PendingMessage>,
        effects: &mut Effects,
    ) {
        let now = Instant::now();
        let connection = self.new_connection(peer, now);
        if !self.store.put(peer, connection.clone(), now) {
            warn!("Connection store exhausted, cannot connect to {}", peer);
            effects.fail_all(deferred, &Error::ConnectionStoreExhausted);
            return;
        }

        let mut guard = connection.lock();
        let conn = &mut *guard;
        let handshaker = match ticket.clone() {
            Some(ticket) => {
                debug!("Resuming session {} with {}", ticket.session_id(), peer);
                Handshaker::resuming_client(peer, ticket)
            }
            None => Handshaker::client(peer),
        };
        conn.ticket = ticket;
        conn.handshake = Some(OngoingHandshake::new(handshaker, Session::new(peer)));
        conn.deferred = deferred;
        self.start_handshake(conn, &connection, effects);
    }

    fn send_under_session(&self, conn: &mut Connection, pending: PendingMessage, effects: &mut Effects) {
        let peer = conn.peer();
        let Some(session) = conn.established.as_mut() else {
            effects.complete(pending, Err(Error::Closed));
            return;
        };
        let context = session.context();

        if let Some(requested) = pending.context() {
            if !self.matcher.read().is_to_be_sent(requested, Some(&context)) {
                warn!("Session with {} does not match {}, dropping message", peer, requested);
                effects.complete(pending, Err(Error::EndpointMismatch));
                return;
            }
        }

        let len = pending.payload().len();
        if len > session.max_fragment_length() {
            effects.complete(pending, Err(Error::MessageTooLarge(len)));
            return;
        }

        let epoch = session.write_epoch();
        let result = session
            .protect(ContentType::ApplicationData, epoch, pending.payload())
            .and_then(|record| {
                let mut buf = Buf::new();
                record.serialize(&mut buf);
                self.sink.send_to(&buf, peer).map_err(Error::from)
            });

        match result {
            Ok(()) => {
                trace!("Sent {} bytes to {}", len, peer);
                conn.refresh(Instant::now());
                effects.complete(pending, Ok(context));
            }
            Err(e) => {
                warn!("Failed to send to {}: {}", peer, e);
                effects.complete(pending, Err(e));
            }
        }
    }

    // Control

    /// Send close_notify to `peer` and forget the connection.
    pub fn close(&self, peer: SocketAddr) {
        let Some(connection) = self.store.get(peer, Instant::now()) else {
            return;
        };
        let mut effects = Effects::default();
        {
            let mut guard = connection.lock();
            let conn = &mut *guard;
            if let Some(session) = conn.established.as_mut() {
                self.send_alert(session, Alert::close_notify());
            }
            self.terminate(conn, &connection, Error::Closed, &mut effects);
        }
        debug!("Closed connection with {}", peer);
        effects.run(self);
    }

    /// Resume the session with `peer` before the next message is sent.
    pub fn force_resume_session_for(&self, peer: SocketAddr) {
        if let Some(connection) = self.store.get(peer, Instant::now()) {
            let mut conn = connection.lock();
            if conn.has_established_session() {
                conn.resumption_required = true;
            }
        }
    }

    pub fn force_resume_all_sessions(&self) {
        self.store.mark_all_as_resumption_required();
    }

    /// Forget every connection.
    pub fn clear_connection_state(&self) {
        let mut effects = Effects::default();
        for connection in self.store.clear() {
            let deferred = connection.lock().cancel_handshake();
            effects.fail_all(deferred, &Error::Closed);
        }
        effects.run(self);
    }

    /// Context of the session established with `peer`.
    pub fn established_session(&self, peer: SocketAddr) -> Option<EndpointContext> {
        let connection = self.store.get(peer, Instant::now())?;
        let conn = connection.lock();
        conn.established.as_ref().map(Session::context)
    }

    /// Largest application payload for one datagram to `peer`.
    pub fn max_fragment_length(&self, peer: SocketAddr) -> usize {
        let mtu = self.mtu();
        let established = self.store.get(peer, Instant::now()).and_then(|connection| {
            let conn = connection.lock();
            conn.established
                .as_ref()
                .map(|s| s.max_application_fragment(mtu))
        });
        established.unwrap_or_else(|| mtu.saturating_sub(HEADER_LENGTH))
    }

    /// Stop processing. Timers are cancelled, handshakes dropped and
    /// connections without established session removed.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.timers.cancel_all();

        let mut effects = Effects::default();
        for connection in self.store.all() {
            let mut conn = connection.lock();
            let deferred = conn.cancel_handshake();
            effects.fail_all(deferred, &Error::NotRunning);
            if !conn.has_established_session() {
                self.store.remove(conn.peer(), &connection);
            }
        }
        effects.run(self);
    }
}

/// Check replay and decrypt. The record is marked read only if it authenticates.
fn open_record(session: &mut Session, record: &Record) -> Option<Vec<u8>> {
    if !session.is_record_processable(record.epoch, record.sequence_number) {
        debug!(
            "Discarding duplicate record (epoch {}, seq {}) from {}",
            record.epoch,
            record.sequence_number,
            session.peer()
        );
        return None;
    }
    match session.unprotect(record) {
        Ok(plaintext) => {
            session.mark_record_as_read(record.epoch, record.sequence_number);
            Some(plaintext)
        }
        Err(e) => {
            debug!("Discarding record from {}: {}", session.peer(), e);
            None
        }
    }
}

fn parse_message(plaintext: &[u8], peer: SocketAddr) -> Option<HandshakeMessage> {
    match HandshakeMessage::parse(plaintext) {
        Ok(message) => Some(message),
        Err(e) => {
            debug!("Discarding handshake message from {}: {}", peer, e);
            None
        }
    }
}

/// The session the handshake works with, or the established one once the
/// handshake completed or when there is none.
fn current_session(conn: &mut Connection) -> Option<&mut Session> {
    match conn.handshake.as_mut().and_then(|h| h.session.as_mut()) {
        Some(session) => Some(session),
        None => conn.established.as_mut(),
    }
}

fn handshake_read_epoch(conn: &Connection) -> Option<u16> {
    let handshake = conn.handshake.as_ref()?;
    handshake
        .session
        .as_ref()
        .or(conn.established.as_ref())
        .map(Session::read_epoch)
}

/// The session whose read epoch is `epoch`, preferring the handshake's.
fn session_for_epoch(conn: &mut Connection, epoch: u16) -> Option<&mut Session> {
    let established = conn.established.as_mut();
    match conn.handshake.as_mut().and_then(|h| h.session.as_mut()) {
        Some(session) if session.read_epoch() == epoch => Some(session),
        _ => established.filter(|s| s.read_epoch() == epoch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StaticPskStore;
    use crate::message::AlertLevel;

    #[derive(Default)]
    struct QueueSink(Mutex<Vec<(SocketAddr, Vec<u8>)>>);

    impl DatagramSink for QueueSink {
        fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<()> {
            self.0.lock().push((peer, datagram.to_vec()));
            Ok(())
        }
    }

    struct NoTimers;

    impl RetransmitTimers for NoTimers {
        fn schedule(&self, _: SocketAddr, _: FlightHandle, _: Duration) {}
        fn cancel_all(&self) {}
    }

    struct Side {
        addr: SocketAddr,
        engine: Engine,
        sink: Arc<QueueSink>,
        alerts: Arc<Mutex<Vec<Alert>>>,
    }

    fn side(port: u16, seed: u64) -> Side {
        let psk = StaticPskStore::new()
            .with_key("node", *b"0123456789abcdef")
            .with_client_identity("node", *b"0123456789abcdef");
        let config = Config::builder()
            .with_psk_store(Arc::new(psk))
            .rng_seed(seed)
            .build()
            .unwrap();
        let sink = Arc::new(QueueSink::default());
        let engine = Engine::new(Arc::new(config), sink.clone(), Arc::new(NoTimers));
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let seen = alerts.clone();
        engine.set_alert_handler(move |_, alert| seen.lock().push(alert));
        Side {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            engine,
            sink,
            alerts,
        }
    }

    fn deliver(from: &Side, to: &Side) -> usize {
        let datagrams = std::mem::take(&mut *from.sink.0.lock());
        let n = datagrams.len();
        for (_, datagram) in datagrams {
            to.engine.receive_datagram(&datagram, from.addr);
        }
        n
    }

    fn established() -> (Side, Side) {
        let client = side(40001, 1);
        let server = side(5684, 2);
        client.engine.send(OutboundMessage::new(server.addr, b"hi".to_vec()));
        client.engine.send(OutboundMessage::new(server.addr, b"again".to_vec()));
        while deliver(&client, &server) + deliver(&server, &client) > 0 {}
        assert!(client.engine.established_session(server.addr).is_some());
        (client, server)
    }

    /// A handshake message under the session `from` has established with `to`.
    fn protected_handshake(from: &Side, to: &Side, body: Body) -> Vec<u8> {
        let connection = from.engine.store.get(to.addr, Instant::now()).unwrap();
        let mut conn = connection.lock();
        let session = conn.established.as_mut().unwrap();
        let epoch = session.write_epoch();
        let message = HandshakeMessage::new(0, body);
        let record = session
            .protect(ContentType::Handshake, epoch, &message.to_bytes())
            .unwrap();
        let mut buf = Buf::new();
        record.serialize(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn hello_request_under_session_is_refused() {
        let (client, server) = established();

        let request = protected_handshake(&server, &client, Body::HelloRequest);
        client.engine.receive_datagram(&request, server.addr);
        assert!(client.engine.established_session(server.addr).is_some());

        deliver(&client, &server);
        let alerts = server.alerts.lock().clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[0].description, AlertDescription::NoRenegotiation);

        // A warning leaves the connection in place
        assert!(server.engine.established_session(client.addr).is_some());
        assert!(client.alerts.lock().is_empty());
    }

    #[test]
    fn stray_handshake_message_under_session_is_ignored() {
        let (client, server) = established();

        let finished = protected_handshake(
            &server,
            &client,
            Body::Finished(crate::message::Finished {
                verify_data: [0; 12],
            }),
        );
        client.engine.receive_datagram(&finished, server.addr);

        assert!(client.sink.0.lock().is_empty());
        assert!(client.engine.established_session(server.addr).is_some());
    }

    #[test]
    fn fault_terminates_only_that_peer() {
        let (client, server) = established();
        let other = side(40002, 3);
        other.engine.send(OutboundMessage::new(server.addr, b"x".to_vec()));
        while deliver(&other, &server) + deliver(&server, &other) > 0 {}
        assert_eq!(server.engine.store.size(), 2);

        server.engine.terminate_on_fault(client.addr);
        assert_eq!(server.engine.store.size(), 1);
        assert!(server.engine.established_session(other.addr).is_some());

        let sent = std::mem::take(&mut *server.sink.0.lock());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, client.addr);
    }
}
