//! Echo client: connects to a local echo server, sends one reliable
//! message, and waits for it to come back.

use rudp::{Event, Host, Packet};

use std::io;

fn main() -> io::Result<()> {
    env_logger::init();

    let server = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7777".into())
        .parse()
        .expect("server address");

    let mut host = Host::new(None, 1, 2, 0, 0)?;
    let peer = host.connect(server, 2, 0)?;

    loop {
        match host.service(1000)? {
            Some(Event::Connect { .. }) => {
                println!("connected to {}", server);
                host.send(peer, 0, Packet::new(b"ping over rudp", Packet::RELIABLE))?;
            }
            Some(Event::Receive { packet, .. }) => {
                println!("echoed back: {:?}", String::from_utf8_lossy(&packet.data()));
                host.disconnect(peer, 0);
            }
            Some(Event::Disconnect { .. }) => {
                println!("disconnected");
                return Ok(());
            }
            None => {}
        }
    }
}
