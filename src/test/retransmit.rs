use super::prelude::*;

#[test]
fn reliable_delivery_survives_datagram_loss() {
    let mut pair = connected_pair(1, 0);

    // Swallow the next two datagrams the server would have decoded; the
    // client has to retransmit past the hole.
    let mut to_drop = 2u32;
    pair.server.set_intercept(Some(Box::new(move |_, _| {
        if to_drop > 0 {
            to_drop -= 1;
            Intercept::Consume
        } else {
            Intercept::Ignore
        }
    })));

    let packet = Packet::new(b"persistent", Packet::RELIABLE);
    unwrap!(pair.client.send(pair.client_peer, 0, packet.clone()));

    let started = Instant::now();
    loop {
        assert!(
            !deadline_passed(started, 20),
            "payload was never retransmitted"
        );

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            assert_eq!(&*packet.data(), b"persistent");
            break;
        }
    }

    // Both ends are still connected afterwards.
    assert_eq!(pair.client.peer(pair.client_peer).state(), PeerState::Connected);
    assert_eq!(pair.server.peer(pair.server_peer).state(), PeerState::Connected);
}

#[test]
fn fragmented_delivery_survives_datagram_loss() {
    let mut pair = connected_pair(1, 0);

    let mut to_drop = 3u32;
    pair.server.set_intercept(Some(Box::new(move |_, _| {
        if to_drop > 0 {
            to_drop -= 1;
            Intercept::Consume
        } else {
            Intercept::Ignore
        }
    })));

    let data: Vec<u8> = (0u32..6000).map(|i| (i % 251) as u8).collect();
    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(&data, Packet::RELIABLE)));

    let started = Instant::now();
    loop {
        assert!(
            !deadline_passed(started, 20),
            "fragment group never completed"
        );

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            assert_eq!(&*packet.data(), &data[..]);
            break;
        }
    }
}

#[test]
fn intercept_error_aborts_service() {
    let mut pair = connected_pair(1, 0);

    pair.server
        .set_intercept(Some(Box::new(move |_, _| Intercept::Error)));

    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(b"x", Packet::RELIABLE)));

    let started = Instant::now();
    loop {
        assert!(!deadline_passed(started, 10), "service never saw the error");

        let _ = unwrap!(pair.client.service(5));
        if pair.server.service(5).is_err() {
            break;
        }
    }
}
