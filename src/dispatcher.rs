//! Hands received records to the engine on the sender's stripe.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::engine::Engine;
use crate::executor::StripedExecutor;
use crate::message::{ContentType, Record};

/// Split `datagram` into records and queue each one for processing.
///
/// Records of unsupported content types are dropped here. Everything else
/// is processed on the stripe of `peer`, in arrival order.
pub fn dispatch(engine: &Arc<Engine>, executor: &StripedExecutor, datagram: &[u8], peer: SocketAddr) {
    if !engine.is_running() {
        return;
    }
    for record in Record::parse_datagram(datagram) {
        if let ContentType::Unknown(t) = record.content_type {
            debug!("Discarding record of unsupported type {} from {}", t, peer);
            continue;
        }
        let engine = engine.clone();
        let queued = executor.execute(peer, move || engine.process_record(record, peer));
        if !queued {
            debug!("Executor stopped, discarding record from {}", peer);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buf;
    use crate::engine::{DatagramSink, RetransmitTimers};
    use crate::flight::FlightHandle;
    use crate::message::ProtocolVersion;
    use crate::Config;
    use std::io;
    use std::time::Duration;

    struct NullSink;

    impl DatagramSink for NullSink {
        fn send_to(&self, _: &[u8], _: SocketAddr) -> io::Result<()> {
            Ok(())
        }
    }

    struct NullTimers;

    impl RetransmitTimers for NullTimers {
        fn schedule(&self, _: SocketAddr, _: FlightHandle, _: Duration) {}
        fn cancel_all(&self) {}
    }

    #[test]
    fn stray_records_leave_no_state() {
        let engine = Arc::new(Engine::new(
            Arc::new(Config::default()),
            Arc::new(NullSink),
            Arc::new(NullTimers),
        ));
        let executor = StripedExecutor::new(1, "test");
        let peer: SocketAddr = "127.0.0.1:5684".parse().unwrap();

        let mut datagram = Buf::new();
        for content_type in [ContentType::ApplicationData, ContentType::Unknown(99)] {
            Record {
                content_type,
                version: ProtocolVersion::DTLS1_2,
                epoch: 1,
                sequence_number: 1,
                fragment: vec![0; 16],
            }
            .serialize(&mut datagram);
        }
        dispatch(&engine, &executor, &datagram, peer);
        executor.shutdown();

        assert_eq!(engine.store().size(), 0);
    }
}
