//! Application messages in and out, and the bound on messages in flight.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::EndpointContext;
use crate::Error;

/// Called once with the outcome of a send.
pub type SendCallback = Box<dyn FnOnce(Result<EndpointContext, Error>) + Send>;

/// An application payload to send to a peer.
pub struct OutboundMessage {
    peer: SocketAddr,
    payload: Vec<u8>,
    context: Option<EndpointContext>,
    callback: Option<SendCallback>,
}

impl OutboundMessage {
    pub fn new(peer: SocketAddr, payload: impl Into<Vec<u8>>) -> Self {
        OutboundMessage {
            peer,
            payload: payload.into(),
            context: None,
            callback: None,
        }
    }

    /// Only send under a session matching `context`.
    pub fn with_context(mut self, context: EndpointContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Be told about the outcome. Success carries the context the message
    /// was actually sent under.
    pub fn on_sent(
        mut self,
        callback: impl FnOnce(Result<EndpointContext, Error>) + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn context(&self) -> Option<&EndpointContext> {
        self.context.as_ref()
    }

    /// Report the outcome for a message that never entered the pipeline.
    pub(crate) fn fail(mut self, error: Error) {
        if let Some(callback) = self.callback.take() {
            callback(Err(error));
        }
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("peer", &self.peer)
            .field("len", &self.payload.len())
            .field("context", &self.context)
            .finish()
    }
}

/// An application payload received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub peer: SocketAddr,
    pub payload: Vec<u8>,
    /// The session the payload was received under.
    pub context: EndpointContext,
}

#[derive(Debug)]
struct GateInner {
    capacity: usize,
    in_flight: AtomicUsize,
}

/// Bounds the messages accepted but not yet completed.
#[derive(Debug, Clone)]
pub struct OutboundGate {
    inner: Arc<GateInner>,
}

impl OutboundGate {
    pub fn new(capacity: usize) -> Self {
        OutboundGate {
            inner: Arc::new(GateInner {
                capacity,
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// A permit, or `None` if `capacity` messages are already in flight.
    pub fn try_acquire(&self) -> Option<Permit> {
        let capacity = self.inner.capacity;
        self.inner
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .ok()?;
        Some(Permit {
            inner: self.inner.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }
}

/// One message's share of the gate, returned on drop.
#[derive(Debug)]
pub struct Permit {
    inner: Arc<GateInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A message admitted by the gate, until its outcome is reported.
///
/// The outcome is reported exactly once: by [`complete`](Self::complete), or
/// as [`Error::NotRunning`] if the message is dropped unreported. The permit
/// is returned after the callback ran.
pub struct PendingMessage {
    message: OutboundMessage,
    _permit: Permit,
}

impl PendingMessage {
    pub fn new(message: OutboundMessage, permit: Permit) -> Self {
        PendingMessage {
            message,
            _permit: permit,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.message.peer
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn context(&self) -> Option<&EndpointContext> {
        self.message.context.as_ref()
    }

    pub fn complete(mut self, result: Result<EndpointContext, Error>) {
        if let Some(callback) = self.message.callback.take() {
            callback(result);
        }
    }

    pub fn fail(self, error: Error) {
        self.complete(Err(error));
    }
}

impl Drop for PendingMessage {
    fn drop(&mut self) {
        if let Some(callback) = self.message.callback.take() {
            callback(Err(Error::NotRunning));
        }
    }
}

impl fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PendingMessage").field(&self.message).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn peer() -> SocketAddr {
        "127.0.0.1:5684".parse().unwrap()
    }

    #[test]
    fn gate_rejects_beyond_capacity() {
        let gate = OutboundGate::new(2);
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn dropped_message_reports_not_running() {
        let gate = OutboundGate::new(1);
        let (tx, rx) = mpsc::channel();
        let message = OutboundMessage::new(peer(), b"hi".to_vec()).on_sent(move |r| {
            tx.send(r).unwrap();
        });
        let pending = PendingMessage::new(message, gate.try_acquire().unwrap());
        drop(pending);

        assert!(matches!(rx.recv().unwrap(), Err(Error::NotRunning)));
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn completion_is_reported_once() {
        let gate = OutboundGate::new(1);
        let (tx, rx) = mpsc::channel();
        let message = OutboundMessage::new(peer(), b"hi".to_vec()).on_sent(move |r| {
            tx.send(r).unwrap();
        });
        PendingMessage::new(message, gate.try_acquire().unwrap())
            .complete(Ok(EndpointContext::new(peer())));

        assert!(rx.recv().unwrap().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(gate.in_flight(), 0);
    }
}
