//! Flight retransmission with exponential backoff.

mod common;

use std::time::Duration;

use common::*;

use dtls_connector::Error;

#[test]
fn flight_resent_at_t_and_2t_then_fails() {
    let (client, server) = pair();
    let outcome = client.send(server.addr, b"hello");
    let original = client.sink.take();
    assert_eq!(original.len(), 1);

    let mut delays = Vec::new();
    let mut resent = Vec::new();
    for _ in 0..3 {
        delays.extend(client.fire_timers());
        resent.extend(client.sink.take());
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
    // Two retransmissions, then the budget is spent
    assert_eq!(resent.len(), 2);
    assert!(client.timers.take().is_empty());

    // Every copy is a ClientHello with a fresh record sequence number
    let seqs: Vec<u64> = original
        .iter()
        .chain(resent.iter())
        .map(|(_, d)| {
            let hdr = parse_records(d)[0];
            assert_eq!(hdr.first, Some(CLIENT_HELLO));
            hdr.seq
        })
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);

    assert!(matches!(outcome.results().as_slice(), [Err(Error::Timeout(_))]));
    assert_eq!(client.failures().len(), 1);
    assert_eq!(client.engine.store().size(), 0);
}

#[test]
fn acknowledged_flights_are_not_resent() {
    let (client, server) = pair();
    let outcome = connect(&client, &server, b"hello");
    assert!(outcome.succeeded());

    client.fire_timers();
    server.fire_timers();

    assert!(client.sink.take().is_empty());
    assert!(server.sink.take().is_empty());
    assert!(client.failures().is_empty());
    assert!(server.failures().is_empty());
}

#[test]
fn each_flight_restarts_the_backoff() {
    let (client, server) = pair();
    client.send(server.addr, b"hello");

    // Lose the first ClientHello once
    client.sink.take();
    assert_eq!(client.fire_timers(), vec![Duration::from_millis(100)]);

    // The HelloVerifyRequest answers the resent hello
    deliver(&client, &server);
    deliver(&server, &client);

    // The scheduled timers are the stale 200 ms one and the new flight's 100 ms
    let mut delays: Vec<Duration> = client.timers.take().into_iter().map(|t| t.2).collect();
    delays.sort();
    assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
}

#[test]
fn stop_cancels_timers_and_fails_pending_messages() {
    let (client, server) = pair();
    let outcome = client.send(server.addr, b"hello");
    client.sink.take();
    let scheduled = client.timers.take();
    assert_eq!(scheduled.len(), 1);

    client.engine.stop();
    assert!(client.timers.was_cancelled());
    assert!(!client.engine.is_running());
    assert!(matches!(outcome.results().as_slice(), [Err(Error::NotRunning)]));
    assert_eq!(client.engine.store().size(), 0);

    // A timer that fires anyway does nothing
    for (peer, handle, _) in scheduled {
        assert!(handle.is_cancelled());
        client.engine.handle_timeout(peer, handle);
    }
    assert!(client.sink.take().is_empty());

    // Sending after stop fails right away
    let late = client.send(server.addr, b"late");
    assert!(matches!(late.results().as_slice(), [Err(Error::NotRunning)]));
}
