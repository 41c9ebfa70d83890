use std::fmt;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::context::{EndpointContext, EndpointContextMatcher};
use crate::dispatcher::dispatch;
use crate::engine::{DatagramSink, Engine, SessionEvent};
use crate::executor::StripedExecutor;
use crate::message::{Alert, MAX_PLAINTEXT_FRAGMENT_LENGTH};
use crate::outbound::{InboundMessage, OutboundMessage};
use crate::scheduler::RetransmitScheduler;
use crate::session::{Session, HEADER_LENGTH};
use crate::store::ConnectionStore;
use crate::{Config, Error};

/// How often the receiver thread checks whether it should stop.
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Record header plus handshake header.
const RECORD_OVERHEAD: usize = 25;

type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;
type AlertHandler = Arc<dyn Fn(SocketAddr, Alert) + Send + Sync>;
type SessionHandler = Arc<dyn Fn(SessionEvent) + Send + Sync>;

#[derive(Default, Clone)]
struct Handlers {
    message: Option<MessageHandler>,
    alert: Option<AlertHandler>,
    session: Option<SessionHandler>,
    matcher: Option<Arc<dyn EndpointContextMatcher>>,
}

impl Handlers {
    fn apply(&self, engine: &Engine) {
        if let Some(h) = self.message.clone() {
            engine.set_message_handler(move |m| h(m));
        }
        if let Some(h) = self.alert.clone() {
            engine.set_alert_handler(move |peer, alert| h(peer, alert));
        }
        if let Some(h) = self.session.clone() {
            engine.set_session_handler(move |e| h(e));
        }
        if let Some(m) = self.matcher.clone() {
            engine.set_context_matcher(m);
        }
    }
}

struct Running {
    engine: Arc<Engine>,
    executor: Arc<StripedExecutor>,
    scheduler: Arc<RetransmitScheduler>,
    local_address: SocketAddr,
    stopping: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

/// A DTLS endpoint on a UDP socket, acting as client and server.
///
/// Connections and sessions survive [`stop`](Self::stop) and are used again
/// after [`start`](Self::start) or [`restart`](Self::restart). Starting on a
/// different address than before requires every session to be resumed.
pub struct Connector {
    config: Arc<Config>,
    store: Arc<ConnectionStore>,
    running: Mutex<Option<Running>>,
    last_address: Mutex<Option<SocketAddr>>,
    handlers: Mutex<Handlers>,
}

impl Connector {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(ConnectionStore::new(
            config.max_connections(),
            config.stale_connection_threshold(),
            config.session_cache(),
        ));
        Connector {
            config: Arc::new(config),
            store,
            running: Mutex::new(None),
            last_address: Mutex::new(None),
            handlers: Mutex::new(Handlers::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the configured address and start processing.
    pub fn start(&self) -> Result<(), Error> {
        self.start_on(self.config.bind_address())
    }

    /// Stop, then start again on the address last bound.
    pub fn restart(&self) -> Result<(), Error> {
        self.stop();
        let address = self.last_address.lock().unwrap_or(self.config.bind_address());
        self.start_on(address)
    }

    fn start_on(&self, address: SocketAddr) -> Result<(), Error> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(address)?;
        let local_address = socket.local_addr()?;
        socket.set_read_timeout(Some(RECEIVE_POLL))?;

        {
            let mut last = self.last_address.lock();
            if last.is_some_and(|previous| previous != local_address) {
                info!("Bound to new address {}, sessions must be resumed", local_address);
                self.store.mark_all_as_resumption_required();
            }
            *last = Some(local_address);
        }

        let socket = Arc::new(socket);
        let scheduler = Arc::new(RetransmitScheduler::new("dtls"));
        let engine = Arc::new(Engine::with_store(
            self.config.clone(),
            self.store.clone(),
            socket.clone() as Arc<dyn DatagramSink>,
            scheduler.clone(),
        ));
        let executor = Arc::new(StripedExecutor::new(
            self.config.connection_thread_count(),
            "dtls-connection",
        ));

        let weak_engine: Weak<Engine> = Arc::downgrade(&engine);
        let weak_executor: Weak<StripedExecutor> = Arc::downgrade(&executor);
        scheduler.set_target(move |peer, handle| {
            let (Some(engine), Some(executor)) = (weak_engine.upgrade(), weak_executor.upgrade()) else {
                return;
            };
            executor.execute(peer, move || engine.handle_timeout(peer, handle));
        });
        self.handlers.lock().apply(&engine);

        let stopping = Arc::new(AtomicBool::new(false));
        let receiver = {
            let engine = engine.clone();
            let executor = executor.clone();
            let stopping = stopping.clone();
            let buffer_size = inbound_buffer_size(&self.config);
            thread::Builder::new()
                .name(format!("dtls-receiver-{}", local_address))
                .spawn(move || receive_loop(&socket, &engine, &executor, &stopping, buffer_size))?
        };

        info!(
            "DTLS connector listening on {} with MTU {}",
            local_address,
            engine.mtu()
        );
        *running = Some(Running {
            engine,
            executor,
            scheduler,
            local_address,
            stopping,
            receiver: Some(receiver),
        });
        Ok(())
    }

    /// Stop processing. Pending timers are cancelled, ongoing handshakes
    /// dropped and queued messages failed.
    pub fn stop(&self) {
        let Some(mut running) = self.running.lock().take() else {
            return;
        };
        running.stopping.store(true, Ordering::Release);
        running.engine.stop();
        running.scheduler.shutdown();
        if let Some(receiver) = running.receiver.take() {
            if receiver.join().is_err() {
                warn!("Receiver thread panicked");
            }
        }
        running.executor.shutdown();
        info!("DTLS connector on {} stopped", running.local_address);
    }

    /// Stop and forget every connection.
    pub fn destroy(&self) {
        self.stop();
        self.store.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| r.engine.is_running())
    }

    fn running(&self) -> Option<(Arc<Engine>, Arc<StripedExecutor>)> {
        self.running
            .lock()
            .as_ref()
            .map(|r| (r.engine.clone(), r.executor.clone()))
    }

    /// Send an application message.
    ///
    /// The outcome is reported to the message's callback. A message that
    /// exceeds the outbound buffer is rejected right away.
    pub fn send(&self, message: OutboundMessage) {
        let Some((engine, executor)) = self.running() else {
            message.fail(Error::NotRunning);
            return;
        };
        let Some(pending) = engine.admit(message) else {
            return;
        };
        let peer = pending.peer();
        // Dropped unrun if the executor stops, which reports NotRunning
        executor.execute(peer, move || engine.send_pending(pending));
    }

    /// Close the connection with `peer`, sending close_notify.
    pub fn close(&self, peer: SocketAddr) {
        if let Some((engine, executor)) = self.running() {
            executor.execute(peer, move || engine.close(peer));
        }
    }

    /// Resume the session with `peer` on the next message sent to it.
    pub fn force_resume_session_for(&self, peer: SocketAddr) {
        match self.running() {
            Some((engine, executor)) => {
                executor.execute(peer, move || engine.force_resume_session_for(peer));
            }
            None => {
                if let Some(connection) = self.store.get(peer, Instant::now()) {
                    let mut conn = connection.lock();
                    if conn.has_established_session() {
                        conn.resumption_required = true;
                    }
                }
            }
        }
    }

    pub fn force_resume_all_sessions(&self) {
        self.store.mark_all_as_resumption_required();
    }

    pub fn clear_connection_state(&self) {
        match self.running() {
            Some((engine, _)) => engine.clear_connection_state(),
            None => {
                self.store.clear();
            }
        }
    }

    /// Context of the session established with `peer`, if any.
    pub fn established_session(&self, peer: SocketAddr) -> Option<EndpointContext> {
        let connection = self.store.get(peer, Instant::now())?;
        let conn = connection.lock();
        conn.established.as_ref().map(Session::context)
    }

    /// Largest application payload for one datagram to `peer`.
    pub fn max_fragment_length(&self, peer: SocketAddr) -> usize {
        match self.running() {
            Some((engine, _)) => engine.max_fragment_length(peer),
            None => self.mtu().saturating_sub(HEADER_LENGTH),
        }
    }

    pub fn mtu(&self) -> usize {
        self.config.mtu().unwrap_or(crate::config::DEFAULT_MTU)
    }

    /// The bound address while running.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_address)
    }

    pub fn protocol(&self) -> &'static str {
        "DTLS"
    }

    /// Called with every application message received.
    pub fn set_message_handler(&self, handler: impl Fn(InboundMessage) + Send + Sync + 'static) {
        let handlers = {
            let mut handlers = self.handlers.lock();
            handlers.message = Some(Arc::new(handler));
            handlers.clone()
        };
        self.reapply(&handlers);
    }

    /// Called with every alert received.
    pub fn set_alert_handler(&self, handler: impl Fn(SocketAddr, Alert) + Send + Sync + 'static) {
        let handlers = {
            let mut handlers = self.handlers.lock();
            handlers.alert = Some(Arc::new(handler));
            handlers.clone()
        };
        self.reapply(&handlers);
    }

    /// Called when a handshake completes or fails.
    pub fn set_session_handler(&self, handler: impl Fn(SessionEvent) + Send + Sync + 'static) {
        let handlers = {
            let mut handlers = self.handlers.lock();
            handlers.session = Some(Arc::new(handler));
            handlers.clone()
        };
        self.reapply(&handlers);
    }

    pub fn set_context_matcher(&self, matcher: Arc<dyn EndpointContextMatcher>) {
        let handlers = {
            let mut handlers = self.handlers.lock();
            handlers.matcher = Some(matcher);
            handlers.clone()
        };
        self.reapply(&handlers);
    }

    fn reapply(&self, handlers: &Handlers) {
        if let Some((engine, _)) = self.running() {
            handlers.apply(&engine);
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self.local_address().unwrap_or(self.config.bind_address());
        write!(f, "{}-{}", self.protocol(), address)
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("local_address", &self.local_address())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Large enough for a full plaintext fragment, or the negotiated maximum
/// fragment length, after protection.
fn inbound_buffer_size(config: &Config) -> usize {
    let fragment = config
        .max_fragment_length()
        .map(|mfl| mfl.length())
        .unwrap_or(MAX_PLAINTEXT_FRAGMENT_LENGTH);
    fragment + RECORD_OVERHEAD + config.cipher_provider().expansion()
}

fn receive_loop(
    socket: &UdpSocket,
    engine: &Arc<Engine>,
    executor: &StripedExecutor,
    stopping: &AtomicBool,
    buffer_size: usize,
) {
    let mut buffer = vec![0; buffer_size];
    while !stopping.load(Ordering::Acquire) {
        match socket.recv_from(&mut buffer) {
            Ok((n, peer)) => {
                trace!("Received datagram of {} bytes from {}", n, peer);
                dispatch(engine, executor, &buffer[..n], peer);
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            // ICMP port unreachable from an earlier send
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                debug!("Ignoring connection reset: {}", e);
            }
            Err(e) => {
                warn!("Receive failed: {}", e);
                thread::sleep(RECEIVE_POLL);
            }
        }
    }
    trace!("Receiver thread exiting");
}
