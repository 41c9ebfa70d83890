//! Handshake roles.
//!
//! A [`Handshaker`] is one of four flows: full or abbreviated, as client or
//! server. It is driven one message at a time and answers with a [`Step`]
//! describing what to send and whether the session is now established.
//! Sending, retransmission and connection bookkeeping are left to the engine.

mod client;
mod server;

use std::fmt;
use std::net::SocketAddr;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub use client::ClientHandshaker;
pub use server::{ResumingServerHandshaker, ServerHandshaker};

use crate::buffer::Buf;
use crate::flight::OutRecord;
use crate::message::{AlertDescription, Body, ContentType, HandshakeMessage};
use crate::rng::SeededRng;
use crate::session::{Session, SessionTicket};
use crate::{Config, HandshakeFailure};

/// What a handshaker needs from its surroundings.
pub struct HandshakeEnv<'a> {
    pub config: &'a Config,
    pub rng: &'a Mutex<SeededRng>,
}

/// Input to a handshaker, already decrypted.
#[derive(Debug, Clone, Copy)]
pub enum Incoming<'a> {
    ChangeCipherSpec,
    Message {
        message: &'a HandshakeMessage,
        /// The message as it was on the wire, for the transcript.
        raw: &'a [u8],
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outgoing {
    Nothing,
    /// A new flight. Only the final flight of a handshake has
    /// `retransmit: false`.
    Flight {
        records: Vec<OutRecord>,
        retransmit: bool,
    },
    /// The peer repeated its flight, so ours was lost: send it again.
    ResendLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continuing,
    Established,
}

/// Result of driving a handshaker by one message.
#[derive(Debug, PartialEq, Eq)]
pub struct Step {
    pub outgoing: Outgoing,
    pub progress: Progress,
}

impl Step {
    fn wait() -> Self {
        Step {
            outgoing: Outgoing::Nothing,
            progress: Progress::Continuing,
        }
    }

    fn resend() -> Self {
        Step {
            outgoing: Outgoing::ResendLast,
            progress: Progress::Continuing,
        }
    }

    fn established(mut self) -> Self {
        self.progress = Progress::Established;
        self
    }

    pub fn is_established(&self) -> bool {
        self.progress == Progress::Established
    }
}

/// The handshake flow run for one connection.
#[derive(Debug)]
pub enum Handshaker {
    Client(ClientHandshaker),
    /// A client offering a cached session. Continues as a full handshake
    /// if the server does not accept it.
    ResumingClient(ClientHandshaker),
    Server(ServerHandshaker),
    ResumingServer(ResumingServerHandshaker),
}

impl Handshaker {
    pub fn client(peer: SocketAddr) -> Self {
        Handshaker::Client(ClientHandshaker::new(peer, None))
    }

    pub fn resuming_client(peer: SocketAddr, ticket: SessionTicket) -> Self {
        Handshaker::ResumingClient(ClientHandshaker::new(peer, Some(ticket)))
    }

    /// `message_seq` is the one of the ClientHello starting the handshake.
    pub fn server(peer: SocketAddr, message_seq: u16) -> Self {
        Handshaker::Server(ServerHandshaker::new(peer, message_seq))
    }

    pub fn resuming_server(peer: SocketAddr, message_seq: u16, ticket: SessionTicket) -> Self {
        Handshaker::ResumingServer(ResumingServerHandshaker::new(peer, message_seq, ticket))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Handshaker::Client(_) => "client",
            Handshaker::ResumingClient(_) => "resuming client",
            Handshaker::Server(_) => "server",
            Handshaker::ResumingServer(_) => "resuming server",
        }
    }

    /// Produce the first flight. Servers wait for the ClientHello instead.
    pub fn start(
        &mut self,
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        match self {
            Handshaker::Client(h) | Handshaker::ResumingClient(h) => h.start(session, env),
            Handshaker::Server(_) | Handshaker::ResumingServer(_) => Ok(Step::wait()),
        }
    }

    pub fn process(
        &mut self,
        incoming: Incoming<'_>,
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        match self {
            Handshaker::Client(h) | Handshaker::ResumingClient(h) => {
                h.process(incoming, session, env)
            }
            Handshaker::Server(h) => h.process(incoming, session, env),
            Handshaker::ResumingServer(h) => h.process(incoming, session, env),
        }
    }

    /// False once the handshake completed. A completed handshaker may
    /// linger to answer a repeated final flight of the peer.
    pub fn is_ongoing(&self) -> bool {
        match self {
            Handshaker::Client(h) | Handshaker::ResumingClient(h) => !h.is_complete(),
            Handshaker::Server(h) => !h.is_complete(),
            Handshaker::ResumingServer(h) => !h.is_complete(),
        }
    }
}

/// How an incoming message relates to the expected message sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    Expected,
    /// Already processed. `resend` if it ended the peer's last flight.
    Duplicate { resend: bool },
    Future,
}

/// Message sequence numbers, the transcript and the flight under construction.
struct Exchange {
    next_send_seq: u16,
    next_receive_seq: u16,
    resend_trigger: Option<u16>,
    transcript: Buf,
    flight: Vec<OutRecord>,
}

impl Exchange {
    fn new(next_send_seq: u16, next_receive_seq: u16) -> Self {
        Exchange {
            next_send_seq,
            next_receive_seq,
            resend_trigger: None,
            transcript: Buf::new(),
            flight: Vec::new(),
        }
    }

    fn arrival(&self, message_seq: u16) -> Arrival {
        if message_seq == self.next_receive_seq {
            Arrival::Expected
        } else if message_seq < self.next_receive_seq {
            Arrival::Duplicate {
                resend: self.resend_trigger == Some(message_seq),
            }
        } else {
            Arrival::Future
        }
    }

    /// Accept the expected message into the transcript.
    fn received(&mut self, raw: &[u8]) {
        self.transcript.extend_from_slice(raw);
        self.next_receive_seq = self.next_receive_seq.wrapping_add(1);
    }

    fn reset_transcript(&mut self) {
        self.transcript.clear();
    }

    fn transcript_hash(&self) -> [u8; 32] {
        Sha256::digest(&*self.transcript).into()
    }

    fn push_message(&mut self, body: Body, epoch: u16) {
        let message = HandshakeMessage::new(self.next_send_seq, body);
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        let payload = message.to_bytes();
        self.transcript.extend_from_slice(&payload);
        self.flight.push(OutRecord {
            content_type: ContentType::Handshake,
            epoch,
            payload,
        });
    }

    fn push_change_cipher_spec(&mut self, epoch: u16) {
        self.flight.push(OutRecord {
            content_type: ContentType::ChangeCipherSpec,
            epoch,
            payload: vec![1],
        });
    }

    /// Finish the flight answering the peer's last message.
    fn take_flight(&mut self, retransmit: bool) -> Step {
        self.resend_trigger = self.next_receive_seq.checked_sub(1);
        Step {
            outgoing: Outgoing::Flight {
                records: std::mem::take(&mut self.flight),
                retransmit,
            },
            progress: Progress::Continuing,
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("next_send_seq", &self.next_send_seq)
            .field("next_receive_seq", &self.next_receive_seq)
            .field("resend_trigger", &self.resend_trigger)
            .finish()
    }
}

/// Check the message sequence, returning early for anything but the expected message.
macro_rules! check_arrival {
    ($exchange:expr, $message:expr) => {
        match $exchange.arrival($message.message_seq) {
            Arrival::Expected => {}
            Arrival::Duplicate { resend: true } => {
                debug!(
                    "Repeated {:?} (seq {}), resending last flight",
                    $message.handshake_type(),
                    $message.message_seq
                );
                return Ok(Step::resend());
            }
            arrival => {
                trace!(
                    "Ignoring {:?} (seq {}): {:?}",
                    $message.handshake_type(),
                    $message.message_seq,
                    arrival
                );
                return Ok(Step::wait());
            }
        }
    };
}
pub(crate) use check_arrival;

fn unexpected(what: impl fmt::Debug, state: impl fmt::Debug) -> HandshakeFailure {
    HandshakeFailure::fatal(
        AlertDescription::UnexpectedMessage,
        format!("Unexpected {:?} in state {:?}", what, state),
    )
}

fn internal(reason: impl fmt::Display) -> HandshakeFailure {
    HandshakeFailure::fatal(AlertDescription::InternalError, reason.to_string())
}

fn verify_finished(
    master_secret: &[u8],
    label: &str,
    transcript_hash: &[u8; 32],
    received: &[u8; 12],
) -> Result<(), HandshakeFailure> {
    let expected = crate::crypto::verify_data(master_secret, label, transcript_hash).map_err(internal)?;
    if &expected != received {
        return Err(HandshakeFailure::fatal(
            AlertDescription::DecryptError,
            "Finished verify_data mismatch",
        ));
    }
    Ok(())
}
