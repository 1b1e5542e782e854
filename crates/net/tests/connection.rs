use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use lanmesh::{Address, Connection, ConnectionEvent, ConnectionState, Socket};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(43000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

const PROTO: u32 = 0x11223344;
const STEP: f32 = 0.05;

#[test]
fn test_reliable_ping_pong() {
    let server_port = next_port();
    let client_port = next_port();

    let mut server = Connection::reliable(PROTO, 10.0, u32::MAX);
    let mut client = Connection::reliable(PROTO, 10.0, u32::MAX);
    server.start(server_port).unwrap();
    client.start(client_port).unwrap();
    server.listen();
    client.connect(Address::new(127, 0, 0, 1, server_port));

    let mut buf = [0u8; 256];
    let mut pings = 0;
    let mut pongs = 0;
    for _ in 0..400 {
        client.send_packet(b"ping");
        while let Some(size) = server.receive_packet(&mut buf) {
            assert_eq!(&buf[..size], b"ping");
            pings += 1;
        }
        if server.is_connected() {
            server.send_packet(b"pong");
        }
        while let Some(size) = client.receive_packet(&mut buf) {
            assert_eq!(&buf[..size], b"pong");
            pongs += 1;
        }
        server.update(STEP);
        client.update(STEP);
        if pings > 10 && pongs > 10 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    assert!(pings > 10, "server received {} pings", pings);
    assert!(pongs > 10, "client received {} pongs", pongs);
    assert!(server.is_connected());
    assert!(client.is_connected());

    let reliability = client.reliability().unwrap();
    assert!(reliability.acked_packets() > 0);
    assert!(reliability.received_packets() > 0);
    assert!(client.send_rate().is_some());

    let client_events: Vec<_> = client.poll_events().collect();
    assert!(client_events.contains(&ConnectionEvent::Started));
    assert!(client_events.contains(&ConnectionEvent::Connected));
}

#[test]
fn test_wrong_protocol_id_does_not_connect() {
    let server_port = next_port();

    let mut server = Connection::new(PROTO, 10.0);
    server.start(server_port).unwrap();
    server.listen();

    // Raw garbage and a mismatched magic both leave the server listening.
    let intruder = Socket::open(0, false).unwrap();
    let server_addr = Address::new(127, 0, 0, 1, server_port);
    intruder.send(server_addr, b"xx").unwrap();
    intruder
        .send(server_addr, &(PROTO + 1).to_be_bytes())
        .unwrap();

    let mut buf = [0u8; 64];
    for _ in 0..50 {
        assert!(server.receive_packet(&mut buf).is_none());
        server.update(STEP);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(server.state(), ConnectionState::Listening);
}

#[test]
fn test_connected_server_ignores_third_party() {
    let server_port = next_port();
    let client_port = next_port();

    let mut server = Connection::new(PROTO, 10.0);
    let mut client = Connection::new(PROTO, 10.0);
    server.start(server_port).unwrap();
    client.start(client_port).unwrap();
    server.listen();
    client.connect(Address::new(127, 0, 0, 1, server_port));

    let mut buf = [0u8; 64];
    let mut connected = false;
    for _ in 0..200 {
        client.send_packet(b"hello");
        while server.receive_packet(&mut buf).is_some() {}
        server.update(STEP);
        client.update(STEP);
        if server.is_connected() {
            connected = true;
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(connected);

    // A valid-looking datagram from another socket must not be surfaced.
    let mut forged = PROTO.to_be_bytes().to_vec();
    forged.extend_from_slice(b"forged");
    let intruder = Socket::open(0, false).unwrap();
    intruder
        .send(Address::new(127, 0, 0, 1, server_port), &forged)
        .unwrap();

    for _ in 0..50 {
        if let Some(size) = server.receive_packet(&mut buf) {
            assert_ne!(&buf[..size], b"forged");
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_disconnect_after_silence() {
    let server_port = next_port();
    let client_port = next_port();

    let mut server = Connection::new(PROTO, 1.0);
    let mut client = Connection::new(PROTO, 1.0);
    server.start(server_port).unwrap();
    client.start(client_port).unwrap();
    server.listen();
    client.connect(Address::new(127, 0, 0, 1, server_port));

    let mut buf = [0u8; 64];
    for _ in 0..200 {
        client.send_packet(b"hello");
        while server.receive_packet(&mut buf).is_some() {}
        server.update(0.01);
        client.update(0.01);
        if server.is_connected() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(server.is_connected());

    // Silence on the server for longer than its timeout.
    server.update(1.2);
    assert_eq!(server.state(), ConnectionState::Disconnected);
    let events: Vec<_> = server.poll_events().collect();
    assert!(events.contains(&ConnectionEvent::Disconnected));
}
