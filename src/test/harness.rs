use crate::host::{Event, Host, PeerId};

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use unwrap::unwrap;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn local() -> SocketAddr {
    unwrap!("127.0.0.1:0".parse())
}

pub fn deadline_passed(started: Instant, secs: u64) -> bool {
    started.elapsed() >= Duration::from_secs(secs)
}

/// A connected client/server pair driven over loopback.
pub struct Pair {
    pub client: Host,
    pub server: Host,
    /// The client's handle for the server.
    pub client_peer: PeerId,
    /// The server's handle for the client.
    pub server_peer: PeerId,
    /// User data the client supplied with its connect request, as seen by
    /// the server's connect event.
    pub server_connect_data: u32,
}

/// Bring up a client and a server and drive both until the handshake
/// completes on each side.
pub fn connected_pair(channel_count: usize, connect_data: u32) -> Pair {
    init_logging();

    let mut server = unwrap!(Host::new(Some(local()), 8, channel_count, 0, 0));
    let server_addr = unwrap!(server.local_addr());

    let mut client = unwrap!(Host::new(None, 1, channel_count, 0, 0));
    let client_peer = unwrap!(client.connect(server_addr, channel_count, connect_data));

    let mut client_connected = false;
    let mut server_side = None;

    let started = Instant::now();
    while !client_connected || server_side.is_none() {
        assert!(
            !deadline_passed(started, 10),
            "handshake did not complete in time"
        );

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
