//! Closing connections and reacting to alerts.

mod common;

use common::*;

use dtls_connector::{AlertDescription, AlertLevel, Error};

#[test]
fn close_notifies_peer_and_forgets_connection() {
    let (client, server) = pair();
    connect(&client, &server, b"first");
    // Clears the server's lingering handshake
    client.send(server.addr, b"second");
    shuttle(&client, &server);

    client.engine.close(server.addr);
    assert_eq!(client.engine.store().size(), 0);

    let sent = client.sink.take();
    assert_eq!(sent.len(), 1);
    let hdrs = parse_records(&sent[0].1);
    assert_eq!(hdrs[0].ctype, ALERT);
    assert_eq!(hdrs[0].epoch, 1);

    server.engine.receive_datagram(&sent[0].1, client.addr);
    let alerts = server.alerts.lock().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, client.addr);
    assert_eq!(alerts[0].1.description, AlertDescription::CloseNotify);
    assert_eq!(server.engine.store().size(), 0);

    // The server answers with its own close_notify, which finds nothing left
    let reply = server.sink.take();
    assert_eq!(reply.len(), 1);
    assert_eq!(parse_records(&reply[0].1)[0].ctype, ALERT);
    client.engine.receive_datagram(&reply[0].1, server.addr);
    assert!(client.alerts.lock().is_empty());
}

#[test]
fn next_message_after_close_starts_fresh_handshake() {
    let (client, server) = pair();
    connect(&client, &server, b"first");
    client.engine.close(server.addr);
    shuttle(&client, &server);

    assert!(connect(&client, &server, b"again").succeeded());
    assert_eq!(client.established_count(), 2);
    assert_eq!(server.payloads(), vec![b"first".to_vec(), b"again".to_vec()]);
}

#[test]
fn fault_in_handler_sends_fatal_alert() {
    let (client, server) = pair();
    connect(&client, &server, b"first");

    server
        .engine
        .set_message_handler(|_| panic!("application handler failed"));
    client.send(server.addr, b"boom");
    shuttle(&client, &server);

    assert_eq!(server.engine.store().size(), 0);
    assert_eq!(client.engine.store().size(), 0);

    let alerts = client.alerts.lock().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].1.level, AlertLevel::Fatal);
    assert_eq!(alerts[0].1.description, AlertDescription::InternalError);
}

#[test]
fn closing_during_handshake_fails_pending_messages() {
    let (client, server) = pair();
    let outcome = client.send(server.addr, b"hello");
    deliver(&client, &server);

    client.engine.close(server.addr);
    assert!(matches!(outcome.results().as_slice(), [Err(Error::Closed)]));
    assert_eq!(client.failures().len(), 1);
    assert_eq!(client.engine.pending_messages(), 0);

    // Nothing to protect an alert with before keys exist
    assert!(client.sink.take().is_empty());
}
