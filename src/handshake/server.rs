use std::net::SocketAddr;

use zeroize::Zeroizing;

use super::{check_arrival, internal, unexpected, verify_finished};
use super::{Arrival, Exchange, HandshakeEnv, Incoming, Step};
use crate::crypto::{derive_ciphers, master_secret, psk_premaster_secret, KeyExchange};
use crate::message::{AlertDescription, Body, ClientHello, ClientKeyExchange, Finished, Random};
use crate::message::{ProtocolVersion, ServerHello, ServerKeyExchange, SessionId};
use crate::message::{COMPRESSION_NULL, NAMED_CURVE_X25519};
use crate::session::{Session, SessionTicket};
use crate::HandshakeFailure;

const SESSION_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitClientHello,
    AwaitClientKeyExchange,
    AwaitChangeCipherSpec,
    AwaitFinished,
    Established,
}

/// Check what the client offers against what we support.
fn negotiate(hello: &ClientHello, env: &HandshakeEnv<'_>) -> Result<(), HandshakeFailure> {
    if hello.client_version != ProtocolVersion::DTLS1_2 {
        return Err(HandshakeFailure::fatal(
            AlertDescription::ProtocolVersion,
            format!("Client version {:?}", hello.client_version),
        ));
    }
    let suite = env.config.cipher_provider().suite();
    if !hello.cipher_suites.contains(&suite) {
        return Err(HandshakeFailure::fatal(
            AlertDescription::HandshakeFailure,
            format!("No common cipher suite in {:?}", hello.cipher_suites),
        ));
    }
    if !hello.compression_methods.contains(&COMPRESSION_NULL) {
        return Err(HandshakeFailure::fatal(
            AlertDescription::HandshakeFailure,
            "Client does not offer null compression",
        ));
    }
    Ok(())
}

fn server_hello(
    random: Random,
    session_id: SessionId,
    hello: &ClientHello,
    env: &HandshakeEnv<'_>,
) -> ServerHello {
    ServerHello {
        server_version: ProtocolVersion::DTLS1_2,
        random,
        session_id,
        cipher_suite: env.config.cipher_provider().suite(),
        compression_method: COMPRESSION_NULL,
        max_fragment_length: hello.max_fragment_length,
    }
}

fn install_keys(
    master: &[u8; 48],
    client_random: &Random,
    server_random: &Random,
    session: &mut Session,
    env: &HandshakeEnv<'_>,
) -> Result<(), HandshakeFailure> {
    let provider = env.config.cipher_provider();
    let ciphers = derive_ciphers(provider, master, &client_random.0, &server_random.0)
        .map_err(internal)?;
    session.set_master_secret(provider.suite(), master);
    session.install_ciphers(ciphers.client_write, ciphers.server_write, provider.expansion());
    Ok(())
}

fn on_change_cipher_spec(
    state: &mut State,
    session: &mut Session,
) -> Result<Step, HandshakeFailure> {
    if *state != State::AwaitChangeCipherSpec {
        return Err(HandshakeFailure::warning(
            AlertDescription::UnexpectedMessage,
            format!("ChangeCipherSpec in state {:?}", state),
        ));
    }
    session.activate_read().map_err(internal)?;
    *state = State::AwaitFinished;
    Ok(Step::wait())
}

/// The server side of a full handshake.
///
/// Answers the (cookie verified) `ClientHello` with `ServerHello`,
/// `ServerKeyExchange` and `ServerHelloDone`, then waits for the client's
/// key exchange and `Finished` before sending its own.
#[derive(Debug)]
pub struct ServerHandshaker {
    peer: SocketAddr,
    state: State,
    exchange: Exchange,
    client_random: Random,
    server_random: Random,
    key_exchange: Option<KeyExchange>,
    master_secret: Option<Zeroizing<[u8; 48]>>,
}

impl ServerHandshaker {
    pub fn new(peer: SocketAddr, message_seq: u16) -> Self {
        ServerHandshaker {
            peer,
            state: State::AwaitClientHello,
            exchange: Exchange::new(message_seq, message_seq),
            client_random: Random::default(),
            server_random: Random::default(),
            key_exchange: None,
            master_secret: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Established
    }

    pub(super) fn process(
        &mut self,
        incoming: Incoming<'_>,
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        let (message, raw) = match incoming {
            Incoming::ChangeCipherSpec => return on_change_cipher_spec(&mut self.state, session),
            Incoming::Message { message, raw } => (message, raw),
        };
        check_arrival!(self.exchange, message);

        match (self.state, &message.body) {
            (State::AwaitClientHello, Body::ClientHello(hello)) => {
                self.on_client_hello(hello, raw, session, env)
            }
            (State::AwaitClientKeyExchange, Body::ClientKeyExchange(cke)) => {
                self.on_client_key_exchange(cke, raw, session, env)
            }
            (State::AwaitFinished, Body::Finished(finished)) => {
                self.on_finished(finished, raw, session)
            }
            (state, _) => Err(unexpected(message.handshake_type(), state)),
        }
    }

    fn on_client_hello(
        &mut self,
        hello: &ClientHello,
        raw: &[u8],
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        negotiate(hello, env)?;
        self.exchange.received(raw);

        let session_id = {
            let mut rng = env.rng.lock();
            self.server_random = Random::new(&mut rng);
            SessionId::random(SESSION_ID_LEN, &mut rng)
        };
        self.client_random = hello.random;
        session.set_id(session_id);
        session.set_max_fragment_length(hello.max_fragment_length);

        let key_exchange = KeyExchange::new();
        let ske = ServerKeyExchange {
            psk_identity_hint: Vec::new(),
            named_curve: NAMED_CURVE_X25519,
            public_key: key_exchange.public_key().to_vec(),
        };
        self.key_exchange = Some(key_exchange);

        let sh = server_hello(self.server_random, session_id, hello, env);
        self.exchange.push_message(Body::ServerHello(sh), 0);
        self.exchange.push_message(Body::ServerKeyExchange(ske), 0);
        self.exchange.push_message(Body::ServerHelloDone, 0);

        debug!("Full handshake with {}, session {}", self.peer, session_id);
        self.state = State::AwaitClientKeyExchange;
        Ok(self.exchange.take_flight(true))
    }

    fn on_client_key_exchange(
        &mut self,
        cke: &ClientKeyExchange,
        raw: &[u8],
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        let psk = env
            .config
            .psk_store()
            .and_then(|store| store.key(&cke.psk_identity))
            .ok_or_else(|| {
                HandshakeFailure::fatal(
                    AlertDescription::UnknownPskIdentity,
                    format!(
                        "Unknown PSK identity {:?} from {}",
                        String::from_utf8_lossy(&cke.psk_identity),
                        self.peer
                    ),
                )
            })?;
        let key_exchange = self
            .key_exchange
            .take()
            .ok_or_else(|| internal("No key exchange in progress"))?;
        let shared = key_exchange
            .complete(&cke.public_key)
            .map_err(|e| HandshakeFailure::fatal(AlertDescription::IllegalParameter, e))?;

        let premaster = psk_premaster_secret(&shared[..], &psk);
        let master = master_secret(&premaster, &self.client_random.0, &self.server_random.0)
            .map_err(internal)?;
        install_keys(&master, &self.client_random, &self.server_random, session, env)?;

        self.exchange.received(raw);
        self.master_secret = Some(master);
        self.state = State::AwaitChangeCipherSpec;
        Ok(Step::wait())
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
            "client finished",
            &self.exchange.transcript_hash(),
            &finished.verify_data,
        )?;
        self.exchange.received(raw);

        self.exchange.push_change_cipher_spec(0);
        session.activate_write().map_err(internal)?;
        let verify_data = crate::crypto::verify_data(
            &master[..],
            "server finished",
            &self.exchange.transcript_hash(),
        )
        .map_err(internal)?;
        self.exchange
            .push_message(Body::Finished(Finished { verify_data }), session.write_epoch());

        self.state = State::Established;
        Ok(self.exchange.take_flight(false).established())
    }
}

/// The server side of an abbreviated handshake, resuming `ticket`.
///
/// Answers the `ClientHello` with `ServerHello`, `ChangeCipherSpec` and
/// `Finished` right away, and is done once the client's `Finished` checks out.
#[derive(Debug)]
pub struct ResumingServerHandshaker {
    peer: SocketAddr,
    state: State,
    exchange: Exchange,
    ticket: SessionTicket,
}

impl ResumingServerHandshaker {
    pub fn new(peer: SocketAddr, message_seq: u16, ticket: SessionTicket) -> Self {
        ResumingServerHandshaker {
            peer,
            state: State::AwaitClientHello,
            exchange: Exchange::new(message_seq, message_seq),
            ticket,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Established
    }

    pub(super) fn process(
        &mut self,
        incoming: Incoming<'_>,
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        let (message, raw) = match incoming {
            Incoming::ChangeCipherSpec => return on_change_cipher_spec(&mut self.state, session),
            Incoming::Message { message, raw } => (message, raw),
        };
        check_arrival!(self.exchange, message);

        match (self.state, &message.body) {
            (State::AwaitClientHello, Body::ClientHello(hello)) => {
                self.on_client_hello(hello, raw, session, env)
            }
            (State::AwaitFinished, Body::Finished(finished)) => {
                verify_finished(
                    self.ticket.master_secret(),
                    "client finished",
                    &self.exchange.transcript_hash(),
                    &finished.verify_data,
                )?;
                self.exchange.received(raw);
                self.state = State::Established;
                Ok(Step::wait().established())
            }
            (state, _) => Err(unexpected(message.handshake_type(), state)),
        }
    }

    fn on_client_hello(
        &mut self,
        hello: &ClientHello,
        raw: &[u8],
        session: &mut Session,
        env: &HandshakeEnv<'_>,
    ) -> Result<Step, HandshakeFailure> {
        negotiate(hello, env)?;
        if self.ticket.cipher_suite() != env.config.cipher_provider().suite() {
            return Err(HandshakeFailure::fatal(
                AlertDescription::HandshakeFailure,
                format!("Cached session uses {:?}", self.ticket.cipher_suite()),
            ));
        }
        self.exchange.received(raw);

        let server_random = Random::new(&mut env.rng.lock());
        let session_id = *self.ticket.session_id();
        session.set_id(session_id);
        session.set_max_fragment_length(hello.max_fragment_length);
        install_keys(
            self.ticket.master_secret(),
            &hello.random,
            &server_random,
            session,
            env,
        )?;

        let sh = server_hello(server_random, session_id, hello, env);
        self.exchange.push_message(Body::ServerHello(sh), 0);
        self.exchange.push_change_cipher_spec(0);
        session.activate_write().map_err(internal)?;
        let verify_data = crate::crypto::verify_data(
            self.ticket.master_secret(),
            "server finished",
            &self.exchange.transcript_hash(),
        )
        .map_err(internal)?;
        self.exchange
            .push_message(Body::Finished(Finished { verify_data }), session.write_epoch());

        debug!("Resuming session {} with {}", session_id, self.peer);
        self.state = State::AwaitChangeCipherSpec;
        Ok(self.exchange.take_flight(true))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::crypto::StaticPskStore;
    use crate::flight::OutRecord;
    use crate::handshake::{ClientHandshaker, Outgoing, Progress};
    use crate::message::{ContentType, HandshakeMessage};
    use crate::rng::SeededRng;
    use crate::Config;

    fn peer() -> SocketAddr {
        "127.0.0.1:5684".parse().unwrap()
    }

    fn config() -> Config {
        let psk = StaticPskStore::new()
            .with_key("device", *b"0123456789abcdef")
            .with_client_identity("device", *b"0123456789abcdef");
        Config::builder().with_psk_store(Arc::new(psk)).build().unwrap()
    }

    fn records(step: Step) -> Vec<OutRecord> {
        match step.outgoing {
            Outgoing::Flight { records, .. } => records,
            other => panic!("expected flight, got {:?}", other),
        }
    }

    /// Feed `records` (as written by one side) to the other, decrypting as needed.
    fn deliver(
        records: &[OutRecord],
        from: &mut Session,
        to: &mut Session,
        process: &mut dyn FnMut(Incoming<'_>, &mut Session) -> Result<Step, HandshakeFailure>,
    ) -> Vec<Step> {
        let mut steps = Vec::new();
        for out in records {
            let record = from.protect(out.content_type, out.epoch, &out.payload).unwrap();
            let plaintext = to.unprotect(&record).unwrap();
            let step = match out.content_type {
                ContentType::ChangeCipherSpec => process(Incoming::ChangeCipherSpec, to),
                _ => {
                    let message = HandshakeMessage::parse(&plaintext).unwrap();
                    process(Incoming::Message { message: &message, raw: &plaintext }, to)
                }
            };
            steps.push(step.unwrap());
        }
        steps
    }

    fn last(steps: Vec<Step>) -> Step {
        steps.into_iter().last().unwrap()
    }

    #[test]
    fn full_handshake_establishes_both_sides() {
        let config = config();
        let rng = Mutex::new(SeededRng::new(Some(3)));
        let env = HandshakeEnv { config: &config, rng: &rng };

        let mut client_session = Session::new(peer());
        let mut server_session = Session::new(peer());
        let mut client = ClientHandshaker::new(peer(), None);
        let mut server = ServerHandshaker::new(peer(), 0);

        let hello = records(client.start(&mut client_session, &env).unwrap());
        let flight = records(last(deliver(
            &hello,
            &mut client_session,
            &mut server_session,
            &mut |i, s| server.process(i, s, &env),
        )));
        assert_eq!(flight.len(), 3);

        let flight = records(last(deliver(
            &flight,
            &mut server_session,
            &mut client_session,
            &mut |i, s| client.process(i, s, &env),
        )));
        assert_eq!(flight.len(), 3);
        assert_eq!(flight[2].epoch, 1);

        let step = last(deliver(
            &flight,
            &mut client_session,
            &mut server_session,
            &mut |i, s| server.process(i, s, &env),
        ));
        assert_eq!(step.progress, Progress::Established);
        let Outgoing::Flight { records: last_flight, retransmit } = step.outgoing else {
            panic!("expected final flight");
        };
        assert!(!retransmit);

        let step = last(deliver(
            &last_flight,
            &mut server_session,
            &mut client_session,
            &mut |i, s| client.process(i, s, &env),
        ));
        assert!(step.is_established());
        assert_eq!(client_session.id(), server_session.id());
        assert_eq!(client_session.ticket(), server_session.ticket());
        assert!(server.is_complete());
        assert!(client.is_complete());
    }

    #[test]
    fn abbreviated_handshake_reuses_master_secret() {
        let config = config();
        let rng = Mutex::new(SeededRng::new(Some(4)));
        let env = HandshakeEnv { config: &config, rng: &rng };

        let id = SessionId::try_new(&[7; 32]).unwrap();
        let ticket = SessionTicket::new(id, config.cipher_provider().suite(), [5; 48], None);

        let mut client_session = Session::new(peer());
        let mut server_session = Session::new(peer());
        let mut client = ClientHandshaker::new(peer(), Some(ticket.clone()));
        let mut server = ResumingServerHandshaker::new(peer(), 0, ticket);

        let hello = records(client.start(&mut client_session, &env).unwrap());
        let flight = records(last(deliver(
            &hello,
            &mut client_session,
            &mut server_session,
            &mut |i, s| server.process(i, s, &env),
        )));
        assert_eq!(flight.len(), 3);

        let step = last(deliver(
            &flight,
            &mut server_session,
            &mut client_session,
            &mut |i, s| client.process(i, s, &env),
        ));
        assert!(step.is_established());
        assert!(client.is_abbreviated());

        let step = last(deliver(
            &records(step),
            &mut client_session,
            &mut server_session,
            &mut |i, s| server.process(i, s, &env),
        ));
        assert!(step.is_established());
        assert_eq!(step.outgoing, Outgoing::Nothing);
        assert_eq!(*server_session.id(), id);
    }

    #[test]
    fn unknown_identity_is_reported() {
        let psk = StaticPskStore::new().with_client_identity("stranger", *b"key");
        let client_config = Config::builder().with_psk_store(Arc::new(psk)).build().unwrap();
        let server_config = config();
        let rng = Mutex::new(SeededRng::new(Some(5)));
        let client_env = HandshakeEnv { config: &client_config, rng: &rng };
        let server_env = HandshakeEnv { config: &server_config, rng: &rng };

        let mut client_session = Session::new(peer());
        let mut server_session = Session::new(peer());
        let mut client = ClientHandshaker::new(peer(), None);
        let mut server = ServerHandshaker::new(peer(), 0);

        let hello = records(client.start(&mut client_session, &client_env).unwrap());
        let flight = records(last(deliver(
            &hello,
            &mut client_session,
            &mut server_session,
            &mut |i, s| server.process(i, s, &server_env),
        )));
        let flight = records(last(deliver(
            &flight,
            &mut server_session,
            &mut client_session,
            &mut |i, s| client.process(i, s, &client_env),
        )));

        let record = client_session
            .protect(flight[0].content_type, 0, &flight[0].payload)
            .unwrap();
        let message = HandshakeMessage::parse(&record.fragment).unwrap();
        let err = server
            .process(
                Incoming::Message { message: &message, raw: &record.fragment },
                &mut server_session,
                &server_env,
            )
            .unwrap_err();
        assert_eq!(err.alert().description, AlertDescription::UnknownPskIdentity);
    }
}
