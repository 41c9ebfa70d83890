//! DTLS 1.2 connector over UDP.
//!
//! A [`Connector`] binds a UDP socket and secures application datagrams
//! with many peers at once, as client and as server. It performs the
//! stateless cookie exchange before committing any state to a new peer,
//! runs full and abbreviated (resumed) PSK handshakes, retransmits flights
//! with exponential backoff and rejects replayed records.
//!
//! Records of one peer are processed in order on one worker thread, while
//! different peers are processed in parallel. The [`Engine`] holds the
//! protocol logic and can be driven without sockets or threads, which is
//! how the integration tests run a client and a server against each other.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dtls_connector::{Config, Connector, OutboundMessage, StaticPskStore};
//!
//! let psk = StaticPskStore::new()
//!     .with_key("sensor-1", *b"0123456789abcdef")
//!     .with_client_identity("sensor-1", *b"0123456789abcdef");
//! let config = Config::builder()
//!     .bind_address("0.0.0.0:5684".parse().unwrap())
//!     .with_psk_store(Arc::new(psk))
//!     .build()
//!     .unwrap();
//!
//! let connector = Connector::new(config);
//! connector.set_message_handler(|m| println!("{} bytes from {}", m.payload.len(), m.peer));
//! connector.start().unwrap();
//!
//! let peer = "192.0.2.1:5684".parse().unwrap();
//! connector.send(OutboundMessage::new(peer, b"hello".to_vec()).on_sent(|r| {
//!     if let Err(e) = r {
//!         eprintln!("send failed: {}", e);
//!     }
//! }));
//! ```
#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod buffer;
mod config;
mod connection;
mod connector;
mod context;
mod cookie;
mod crypto;
mod dispatcher;
mod engine;
mod error;
mod executor;
mod flight;
mod handshake;
mod message;
mod outbound;
mod rng;
mod scheduler;
mod session;
mod store;
mod timer;
mod util;
mod window;

pub use config::{Config, ConfigBuilder, DEFAULT_MTU, MIN_MTU};
pub use connector::Connector;
pub use context::{EndpointContext, EndpointContextMatcher};
pub use context::{RelaxedContextMatcher, StrictContextMatcher};
pub use crypto::{Aad, Aes128GcmProvider, CipherProvider, PskStore, RecordCipher, StaticPskStore};
pub use dispatcher::dispatch;
pub use engine::{DatagramSink, Engine, RetransmitTimers, SessionEvent};
pub use error::{Error, HandshakeFailure};
pub use executor::StripedExecutor;
pub use flight::{FlightHandle, FlightState};
pub use message::{Alert, AlertDescription, AlertLevel, CipherSuite, SessionId};
pub use outbound::{InboundMessage, OutboundMessage};
pub use scheduler::RetransmitScheduler;
pub use session::SessionTicket;
pub use store::{ConnectionStore, InMemorySessionCache, SessionCache};
