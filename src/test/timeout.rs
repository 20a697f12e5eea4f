use super::prelude::*;

#[test]
fn peer_times_out_when_the_remote_goes_silent() {
    let mut pair = connected_pair(1, 0);

    // Tight budgets so the test does not sit through the default 30s cap.
    pair.client.set_timeout(pair.client_peer, 2, 200, 500);

    // Outstanding reliable traffic arms the retransmission timer; the
    // server is never serviced again.
    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(b"void", Packet::RELIABLE)));

    let started = Instant::now();
    loop {
        assert!(
            !deadline_passed(started, 15),
            "client never noticed the dead peer"
        );

        if let Some(Event::Disconnect { peer, data }) = unwrap!(pair.client.service(20)) {
            assert_eq!(peer, pair.client_peer);
            assert_eq!(data, 0);
            break;
        }
    }

    assert_eq!(
        pair.client.peer(pair.client_peer).state(),
        PeerState::Disconnected
    );
}

#[test]
fn connect_to_a_dead_address_times_out() {
    init_logging();

    // Bind a throwaway socket to learn a port nothing will answer on.
    let dead_addr = {
        let placeholder = unwrap!(std::net::UdpSocket::bind("127.0.0.1:0"));
        unwrap!(placeholder.local_addr())
    };

    let mut client = unwrap!(Host::new(None, 1, 1, 0, 0));
    let peer = unwrap!(client.connect(dead_addr, 1, 0));
    client.set_timeout(peer, 2, 200, 500);

    let started = Instant::now();
    loop {
        assert!(
            !deadline_passed(started, 15),
            "connect attempt never gave up"
        );

        if let Some(Event::Disconnect { data, .. }) = unwrap!(client.service(20)) {
            assert_eq!(data, 0);
            break;
        }
    }

    assert_eq!(client.peer(peer).state(), PeerState::Disconnected);
}

#[test]
fn idle_connection_stays_alive_on_keepalives() {
    let mut pair = connected_pair(1, 0);

    // Long enough for several ping intervals to pass with no user traffic.
    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(1800) {
        let _ = unwrap!(pair.client.service(10));
        let _ = unwrap!(pair.server.service(10));
    }

    assert_eq!(pair.client.peer(pair.client_peer).state(), PeerState::Connected);
    assert_eq!(pair.server.peer(pair.server_peer).state(), PeerState::Connected);
}
