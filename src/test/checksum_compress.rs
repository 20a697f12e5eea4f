use super::prelude::*;

use crate::crc32::crc32;

fn guarded_pair() -> Pair {
    init_logging();

    let mut server = unwrap!(Host::new(Some(local()), 8, 2, 0, 0));
    server.set_checksum(Some(Box::new(crc32)));
    server.compress_with_range_coder();
    let server_addr = unwrap!(server.local_addr());

    let mut client = unwrap!(Host::new(None, 1, 2, 0, 0));
    client.set_checksum(Some(Box::new(crc32)));
    client.compress_with_range_coder();
    let client_peer = unwrap!(client.connect(server_addr, 2, 0));

    let mut client_connected = false;
    let mut server_side = None;

    let started = Instant::now();
    while !client_connected || server_side.is_none() {
        assert!(!deadline_passed(started, 10), "guarded handshake stalled");

        if let Some(Event::Connect { .. }) = unwrap!(client.service(5)) {
            client_connected = true;
        }
        if let Some(Event::Connect { peer, data }) = unwrap!(server.service(5)) {
            server_side = Some((peer, data));
        }
    }

    let (server_peer, server_connect_data) = unwrap!(server_side);
    Pair {
        client,
        server,
        client_peer,
        server_peer,
        server_connect_data,
    }
}

#[test]
fn checksummed_compressed_link_round_trips() {
    let mut pair = guarded_pair();

    // Compressible payload so the range coder actually kicks in.
    let data: Vec<u8> = b"abcabcabc".iter().cycle().take(900).cloned().collect();
    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(&data, Packet::RELIABLE)));

    let started = Instant::now();
    loop {
        assert!(!deadline_passed(started, 10), "payload never arrived");

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            assert_eq!(&*packet.data(), &data[..]);
            break;
        }
    }
}

#[test]
fn checksummed_fragmented_payload_round_trips() {
    let mut pair = guarded_pair();

    let data: Vec<u8> = (0u32..7000).map(|i| (i % 97) as u8).collect();
    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(&data, Packet::RELIABLE)));

    let started = Instant::now();
    loop {
        assert!(!deadline_passed(started, 10), "payload never arrived");

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            assert_eq!(&*packet.data(), &data[..]);
            break;
        }
    }
}

#[test]
fn garbage_datagrams_are_ignored() {
    let mut pair = guarded_pair();
    let server_addr = unwrap!(pair.server.local_addr());

    // Spray raw junk at the server from outside the protocol.
    let rogue = unwrap!(std::net::UdpSocket::bind("127.0.0.1:0"));
    for len in [1usize, 2, 7, 48, 200] {
        let junk: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
        unwrap!(rogue.send_to(&junk, server_addr));
    }

    // The server shrugs it off and keeps serving the real session.
    for _ in 0..10 {
        if let Some(Event::Disconnect { .. }) = unwrap!(pair.server.service(2)) {
            panic!("junk datagrams disturbed the session");
        }
        let _ = unwrap!(pair.client.service(2));
    }

    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(b"still here", Packet::RELIABLE)));

    let started = Instant::now();
    loop {
        assert!(!deadline_passed(started, 10), "session broke after junk");

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            assert_eq!(&*packet.data(), b"still here");
            break;
        }
    }
}
