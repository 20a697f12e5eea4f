use super::prelude::*;

const CLIENTS: usize = 8;

#[test]
fn a_room_of_clients_connects_broadcasts_and_drains() {
    init_logging();

    let mut server = unwrap!(Host::new(Some(local()), CLIENTS, 2, 0, 0));
    let server_addr = unwrap!(server.local_addr());

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        let mut client = unwrap!(Host::new(None, 1, 2, 0, 0));
        let peer = unwrap!(client.connect(server_addr, 2, 0));
        clients.push((client, peer));
    }

    // Drive everything until the server has the full room.
    let started = Instant::now();
    while server.connected_peers() < CLIENTS {
        assert!(
            !deadline_passed(started, 20),
            "only {} of {} clients connected",
            server.connected_peers(),
            CLIENTS
        );

        let _ = unwrap!(server.service(2));
        for (client, _) in &mut clients {
            let _ = unwrap!(client.service(1));
        }
    }

    // One broadcast lands exactly once at every client.
    server.broadcast(0, Packet::new(b"welcome", Packet::RELIABLE));

    let mut greeted = vec![false; CLIENTS];
    let started = Instant::now();
    while greeted.iter().any(|&done| !done) {
        assert!(!deadline_passed(started, 20), "broadcast did not fan out");

        let _ = unwrap!(server.service(2));
        for (index, (client, _)) in clients.iter_mut().enumerate() {
            if let Some(Event::Receive { packet, .. }) = unwrap!(client.service(1)) {
                assert_eq!(&*packet.data(), b"welcome");
                assert!(!greeted[index], "client {} greeted twice", index);
                greeted[index] = true;
            }
        }
    }

    // Hard disconnects drain the server's peer table.
    for (client, peer) in &mut clients {
        client.disconnect_now(*peer, 0);
    }

    let started = Instant::now();
    while server.connected_peers() > 0 {
        assert!(
            !deadline_passed(started, 20),
            "{} peers still linger",
            server.connected_peers()
        );
        let _ = unwrap!(server.service(5));
    }
}
