use std::net::SocketAddr;

use zeroize::Zeroizing;

use super::{check_arrival, internal, unexpected, verify_finished};
use super::{Arrival, Exchange, HandshakeEnv, Incoming, Step};
use crate::crypto::{derive_ciphers, master_secret, psk_premaster_secret, KeyExchange};
use crate::message::{AlertDescription, Body, ClientHello, ClientKeyExchange, Cookie, Finished};
use crate::message::{ProtocolVersion, Random, ServerHello, ServerKeyExchange};
use crate::message::{COMPRESSION_NULL, NAMED_CURVE_X25519};
use crate::session::{Session, SessionTicket};
use crate::HandshakeFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    AwaitServerHello,
    AwaitServerKeyExchange,
    AwaitServerHelloDone,
    AwaitChangeCipherSpec,
    AwaitFinished,
    Established,
}

/// The client side, full or abbreviated.
///
/// Full: `ClientHello` (once more with the cookie after a
/// `HelloVerifyRequest`), then `ClientKeyExchange`, `ChangeCipherSpec` and
/// `Finished` once the server's hello flight is in.
///
/// Abbreviated: the `ClientHello` offers the session id of `ticket`. If the
/// `ServerHello` echoes it, the server's `ChangeCipherSpec` and `Finished`
/// follow directly and the client answers with its own. Any other session
/// id continues as a full handshake.
#[derive(Debug)]
pub struct ClientHandshaker {
    peer: SocketAddr,
    state: State,
    exchange: Exchange,
    ticket: Option<SessionTicket>,
    abbreviated: bool,
    client_random: Random,
    server_random: Random,
    cookie: Cookie,
    server_public: Vec<u8>,
    master_secret: Option<Zeroizing<[u8; 48]>>,
}

impl ClientHandshaker {
    pub fn new(peer: SocketAddr, ticket: Option<SessionTicket>) -> Self {
        ClientHandshaker {
            peer,
            state: State::Start,
            exchange: Exchange::new(0, 0),
            ticket,
            abbreviated: false,
            client_random: Random::default(),
            server_random: Random::default(),
            cookie: Cookie::EMPTY,
            server_public: Vec::new(),
            master_secret: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Established
    }

    /// Whether the server accepted the offered session.
    pub fn is_abbreviated(&self) -> bool {
        self.abbreviated
    }

    pub(super) fn start(
        &mut self,
        _session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        if self.state != State::Start {
            return Err(unexpected("start", self.state));
        }
        self.client_random = Random::new(&mut env.rng.lock());
        debug!(
            "Starting {} handshake with {}",
            if self.ticket.is_some() { "resuming" } else { "full" },
            self.peer
        );
        self.send_client_hello(env)
    }

    fn send_client_hello(&mut self, env: &HandshakeEnv<'_>) -> Result<Step, HandshakeFailure> {
        let offered = self.ticket.as_ref().map(|t| *t.session_id());
        let hello = ClientHello {
            client_version: ProtocolVersion::DTLS1_2,
            random: self.client_random,
            session_id: offered.unwrap_or_default(),
            cookie: self.cookie,
            cipher_suites: vec![env.config.cipher_provider().suite()],
            compression_methods: vec![COMPRESSION_NULL],
            max_fragment_length: env.config.max_fragment_length(),
        };
        self.exchange.push_message(Body::ClientHello(hello), 0);
        self.state = State::AwaitServerHello;
        Ok(self.exchange.take_flight(true))
    }

    pub(super) fn process(
        &mut self,
        incoming: Incoming<'_>,
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        let (message, raw) = match incoming {
            Incoming::ChangeCipherSpec => return self.on_change_cipher_spec(session),
            Incoming::Message { message, raw } => (message, raw),
        };
        check_arrival!(self.exchange, message);

        match (self.state, &message.body) {
            (State::AwaitServerHello, Body::HelloVerifyRequest(hvr)) => {
                trace!("Cookie of {} bytes from {}", hvr.cookie.len(), self.peer);
                self.exchange.received(&[]);
                // The transcript starts over with the second ClientHello
                self.exchange.reset_transcript();
                self.cookie = hvr.cookie;
                self.send_client_hello(env)
            }
            (State::AwaitServerHello, Body::ServerHello(hello)) => {
                self.on_server_hello(hello, raw, session, env)
            }
            (State::AwaitServerKeyExchange, Body::ServerKeyExchange(ske)) => {
                self.on_server_key_exchange(ske, raw)
            }
            (State::AwaitServerHelloDone, Body::ServerHelloDone) => {
                self.exchange.received(raw);
                self.send_key_exchange(session, env)
            }
            (State::AwaitFinished, Body::Finished(finished)) => {
                self.on_finished(finished, raw, session)
            }
            (state, _) => Err(unexpected(message.handshake_type(), state)),
        }
    }

    fn on_change_cipher_spec(&mut self, session: &mut Session) -> Result<Step, HandshakeFailure> {
        if self.state != State::AwaitChangeCipherSpec {
            return Err(HandshakeFailure::warning(
                AlertDescription::UnexpectedMessage,
                format!("ChangeCipherSpec in state {:?}", self.state),
            ));
        }
        session.activate_read().map_err(internal)?;
        self.state = State::AwaitFinished;
        Ok(Step::wait())
    }

    fn on_server_hello(
        &mut self,
        hello: &ServerHello,
        raw: &[u8],
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        if hello.server_version != ProtocolVersion::DTLS1_2 {
            return Err(HandshakeFailure::fatal(
                AlertDescription::ProtocolVersion,
                format!("Server version {:?}", hello.server_version),
            ));
        }
        let provider = env.config.cipher_provider();
        if hello.cipher_suite != provider.suite() || hello.compression_method != COMPRESSION_NULL {
            return Err(HandshakeFailure::fatal(
                AlertDescription::IllegalParameter,
                format!("Server selected {:?}", hello.cipher_suite),
            ));
        }
        if hello.max_fragment_length.is_some()
            && hello.max_fragment_length != env.config.max_fragment_length()
        {
            return Err(HandshakeFailure::fatal(
                AlertDescription::IllegalParameter,
                "Server changed the max fragment length",
            ));
        }

        self.exchange.received(raw);
        self.server_random = hello.random;
        session.set_id(hello.session_id);
        session.set_max_fragment_length(hello.max_fragment_length);

        let resumed = self
            .ticket
            .as_ref()
            .filter(|t| !hello.session_id.is_empty() && *t.session_id() == hello.session_id)
            .cloned();

        let Some(ticket) = resumed else {
            if self.ticket.is_some() {
                debug!("Server {} declined resumption, full handshake", self.peer);
            }
            self.state = State::AwaitServerKeyExchange;
            return Ok(Step::wait());
        };

        if ticket.cipher_suite() != hello.cipher_suite {
            return Err(HandshakeFailure::fatal(
                AlertDescription::IllegalParameter,
                "Resumed session with a different cipher suite",
            ));
        }
        self.abbreviated = true;
        let master = Zeroizing::new(*ticket.master_secret());
        self.install_keys(&master, session, env)?;
        self.master_secret = Some(master);
        self.state = State::AwaitChangeCipherSpec;
        Ok(Step::wait())
    }

    fn on_server_key_exchange(
        &mut self,
        ske: &ServerKeyExchange,
        raw: &[u8],
    ) -> Result<Step, HandshakeFailure> {
        if ske.named_curve != NAMED_CURVE_X25519 {
            return Err(HandshakeFailure::fatal(
                AlertDescription::HandshakeFailure,
                format!("Unsupported named curve {}", ske.named_curve),
            ));
        }
        self.exchange.received(raw);
        self.server_public = ske.public_key.clone();
        self.state = State::AwaitServerHelloDone;
        Ok(Step::wait())
    }

    fn send_key_exchange(
        &mut self,
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        let (identity, psk) = env
            .config
            .psk_store()
            .and_then(|store| store.identity(self.peer))
            .ok_or_else(|| {
                HandshakeFailure::fatal(
                    AlertDescription::HandshakeFailure,
                    format!("No PSK identity for {}", self.peer),
                )
            })?;

        let kx = KeyExchange::new();
        let public_key = kx.public_key().to_vec();
        let shared = kx.complete(&self.server_public).map_err(|e| {
            HandshakeFailure::fatal(AlertDescription::IllegalParameter, e)
        })?;
        let premaster = psk_premaster_secret(&shared[..], &psk);
        let master = master_secret(&premaster, &self.client_random.0, &self.server_random.0)
            .map_err(internal)?;
        self.install_keys(&master, session, env)?;

        let cke = ClientKeyExchange {
            psk_identity: identity,
            public_key,
        };
        self.exchange.push_message(Body::ClientKeyExchange(cke), 0);
        self.exchange.push_change_cipher_spec(0);
        session.activate_write().map_err(internal)?;
        let verify_data = crate::crypto::verify_data(
            &master[..],
            "client finished",
            &self.exchange.transcript_hash(),
        )
        .map_err(internal)?;
        self.exchange
            .push_message(Body::Finished(Finished { verify_data }), session.write_epoch());

        self.master_secret = Some(master);
        self.state = State::AwaitChangeCipherSpec;
        Ok(self.exchange.take_flight(true))
    }

    fn install_keys(
        &self,
        master: &[u8; 48],
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<(), HandshakeFailure> {
        let provider = env.config.cipher_provider();
        let ciphers = derive_ciphers(
            provider,
            master,
            &self.client_random.0,
            &self.server_random.0,
        )
        .map_err(internal)?;
        session.set_master_secret(provider.suite(), master);
        session.install_ciphers(ciphers.server_write, ciphers.client_write, provider.expansion());
        Ok(())
    }

    fn on_finished(
        &mut self,
        finished: &Finished,
        raw: &[u8],
        session: &mut Session,
    ) -> Result<Step, HandshakeFailure> {
        let master = self
            .master_secret
            .clone()
            .ok_or_else(|| internal("Finished without master secret"))?;
        verify_finished(
            &master[..],
            "server finished",
            &self.exchange.transcript_hash(),
            &finished.verify_data,
        )?;
        self.exchange.received(raw);
        self.state = State::Established;

        if !self.abbreviated {
            return Ok(Step::wait().established());
        }

        // Abbreviated: our ChangeCipherSpec and Finished close the handshake
        self.exchange.push_change_cipher_spec(0);
        session.activate_write().map_err(internal)?;
        let verify_data = crate::crypto::verify_data(
            &master[..],
            "client finished",
            &self.exchange.transcript_hash(),
        )
        .map_err(internal)?;
        self.exchange
            .push_message(Body::Finished(Finished { verify_data }), session.write_epoch());
        Ok(self.exchange.take_flight(false).established())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Outgoing;
    use crate::message::{HandshakeMessage, HelloVerifyRequest};
    use crate::rng::SeededRng;
    use crate::Config;
    use parking_lot::Mutex;

    fn env_parts() -> (Config, Mutex<SeededRng>) {
        (Config::default(), Mutex::new(SeededRng::new(Some(1))))
    }

    fn flight_messages(step: Step) -> Vec<HandshakeMessage> {
        let Outgoing::Flight { records, .. } = step.outgoing else {
            panic!("expected flight, got {:?}", step.outgoing);
        };
        records
            .iter()
            .filter(|r| r.content_type == crate::message::ContentType::Handshake)
            .map(|r| HandshakeMessage::parse(&r.payload).unwrap())
            .collect()
    }

    #[test]
    fn cookie_exchange_resends_hello_with_cookie() {
        let (config, rng) = env_parts();
        let env = HandshakeEnv { config: &config, rng: &rng };
        let peer = "127.0.0.1:5684".parse().unwrap();
        let mut session = Session::new(peer);
        let mut client = ClientHandshaker::new(peer, None);

        let first = flight_messages(client.start(&mut session, &env).unwrap());
        assert_eq!(first[0].message_seq, 0);

        let cookie = Cookie::try_new(&[9; 16]).unwrap();
        let hvr = HandshakeMessage::new(
            0,
            Body::HelloVerifyRequest(HelloVerifyRequest {
                server_version: ProtocolVersion::DTLS1_2,
                cookie,
            }),
        );
        let raw = hvr.to_bytes();
        let step = client
            .process(Incoming::Message { message: &hvr, raw: &raw }, &mut session, &env)
            .unwrap();
        let second = flight_messages(step);
        assert_eq!(second[0].message_seq, 1);
        let Body::ClientHello(hello) = &second[0].body else {
            panic!("expected ClientHello");
        };
        assert_eq!(hello.cookie, cookie);

        // A repeated HelloVerifyRequest means our hello got lost
        let step = client
            .process(Incoming::Message { message: &hvr, raw: &raw }, &mut session, &env)
            .unwrap();
        assert_eq!(step.outgoing, Outgoing::ResendLast);
    }

    #[test]
    fn unexpected_change_cipher_spec_is_not_fatal() {
        let (config, rng) = env_parts();
        let env = HandshakeEnv { config: &config, rng: &rng };
        let peer = "127.0.0.1:5684".parse().unwrap();
        let mut session = Session::new(peer);
        let mut client = ClientHandshaker::new(peer, None);
        client.start(&mut session, &env).unwrap();

        let err = client
            .process(Incoming::ChangeCipherSpec, &mut session, &env)
            .unwrap_err();
        assert!(!err.is_fatal());
    }
}
