//! Echo server: accepts connections on port 7777 and bounces every payload
//! back on the channel it arrived on.

use rudp::{Event, Host};

use std::io;

fn main() -> io::Result<()> {
    env_logger::init();

    let address = "0.0.0.0:7777".parse().unwrap();
    let mut host = Host::new(Some(address), 32, 2, 0, 0)?;

    println!("listening on {}", host.local_addr()?);

    loop {
        match host.service(1000)? {
            Some(Event::Connect { peer, data }) => {
                println!("peer {:?} connected (data {})", peer, data);
            }
            Some(Event::Disconnect { peer, data }) => {
                println!("peer {:?} disconnected (data {})", peer, data);
            }
            Some(Event::Receive {
                peer,
                channel_id,
                packet,
            }) => {
                println!(
                    "peer {:?} sent {} bytes on channel {}",
                    peer,
                    packet.len(),
                    channel_id
                );
                let _ = host.send(peer, channel_id, packet);
            }
            None => {}
        }
    }
}
