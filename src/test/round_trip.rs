use super::prelude::*;

#[test]
fn connect_data_reaches_the_acceptor() {
    let pair = connected_pair(2, 0xABCD);

    assert_eq!(pair.server_connect_data, 0xABCD);
    assert_eq!(pair.client.peer(pair.client_peer).state(), PeerState::Connected);
    assert_eq!(pair.server.peer(pair.server_peer).state(), PeerState::Connected);
    assert_eq!(pair.server.connected_peers(), 1);
}

#[test]
fn reliable_payload_is_delivered_once() {
    let mut pair = connected_pair(2, 0);

    let packet = Packet::new(b"hello", Packet::RELIABLE);
    unwrap!(pair.client.send(pair.client_peer, 0, packet.clone()));

    let mut received = None;
    let started = Instant::now();
    while received.is_none() {
        assert!(!deadline_passed(started, 10), "payload never arrived");

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive {
            channel_id,
            packet,
            ..
        }) = unwrap!(pair.server.service(5))
        {
            received = Some((channel_id, packet));
        }
    }

    let (channel_id, delivered) = unwrap!(received);
    assert_eq!(channel_id, 0);
    assert_eq!(&*delivered.data(), b"hello");
    assert_ne!(delivered.flags() & Packet::RELIABLE, 0);

    // The sender's handle observes the sent mark once the acknowledgement
    // lands and the transport releases its last reference.
    let started = Instant::now();
    while packet.flags() & Packet::SENT == 0 {
        assert!(!deadline_passed(started, 10), "packet never marked sent");
        let _ = unwrap!(pair.client.service(5));
        let _ = unwrap!(pair.server.service(5));
    }

    // A quiet follow-up window must not produce a duplicate delivery.
    for _ in 0..20 {
        let _ = unwrap!(pair.client.service(1));
        if let Some(Event::Receive { .. }) = unwrap!(pair.server.service(1)) {
            panic!("reliable payload delivered twice");
        }
    }
}

#[test]
fn unreliable_payload_is_delivered() {
    let mut pair = connected_pair(1, 0);

    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(b"loose", 0)));

    let started = Instant::now();
    loop {
        assert!(!deadline_passed(started, 10), "payload never arrived");

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            assert_eq!(&*packet.data(), b"loose");
            assert_eq!(packet.flags() & Packet::RELIABLE, 0);
            break;
        }
    }
}

#[test]
fn empty_payload_round_trips() {
    let mut pair = connected_pair(1, 0);

    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(b"", Packet::RELIABLE)));

    let started = Instant::now();
    loop {
        assert!(!deadline_passed(started, 10), "payload never arrived");

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            assert!(packet.is_empty());
            break;
        }
    }
}

#[test]
fn disconnect_reports_user_data() {
    let mut pair = connected_pair(1, 0);

    pair.client.disconnect(pair.client_peer, 42);

    let mut client_saw = None;
    let mut server_saw = None;

    let started = Instant::now();
    while client_saw.is_none() || server_saw.is_none() {
        assert!(!deadline_passed(started, 10), "disconnect never completed");

        if let Some(Event::Disconnect { data, .. }) = unwrap!(pair.client.service(5)) {
            client_saw = Some(data);
        }
        if let Some(Event::Disconnect { data, .. }) = unwrap!(pair.server.service(5)) {
            server_saw = Some(data);
        }
    }

    // The remote end learns the user datum; the local notification carries
    // none.
    assert_eq!(server_saw, Some(42));
    assert_eq!(client_saw, Some(0));

    assert_eq!(pair.client.peer(pair.client_peer).state(), PeerState::Disconnected);
    assert_eq!(pair.server.peer(pair.server_peer).state(), PeerState::Disconnected);
    assert_eq!(pair.server.connected_peers(), 0);
}

#[test]
fn send_to_a_disconnected_peer_is_refused() {
    let mut pair = connected_pair(1, 0);

    pair.client.disconnect_now(pair.client_peer, 0);

    assert!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(b"late", Packet::RELIABLE))
        .is_err());
}

#[test]
fn send_to_an_unknown_channel_is_refused() {
    let mut pair = connected_pair(2, 0);

    assert!(pair
        .client
        .send(pair.client_peer, 5, Packet::new(b"nope", Packet::RELIABLE))
        .is_err());
}
