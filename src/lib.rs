//! Connection-oriented reliable and unreliable message transport over a
//! single UDP socket.
//!
//! A [`Host`] multiplexes up to a few thousand peer sessions over one
//! datagram socket. Each peer carries independent channels of ordered
//! reliable, sequenced unreliable, and unsequenced traffic, with
//! transparent fragmentation of payloads that exceed the path MTU,
//! adaptive retransmission, and bandwidth throttling.
//!
//! Everything is driven from a single thread through [`Host::service`]:
//!
//! ```no_run
//! use rudp::{Event, Host, Packet};
//!
//! let mut client = Host::new(None, 1, 2, 0, 0).unwrap();
//! let server_addr = "127.0.0.1:7777".parse().unwrap();
//! let peer = client.connect(server_addr, 2, 0).unwrap();
//!
//! loop {
//!     match client.service(100).unwrap() {
//!         Some(Event::Connect { peer, .. }) => {
//!             client.send(peer, 0, Packet::new(b"hello", Packet::RELIABLE)).unwrap();
//!         }
//!         Some(Event::Receive { packet, .. }) => {
//!             println!("received {} bytes", packet.len());
//!         }
//!         Some(Event::Disconnect { .. }) => break,
//!         None => {}
//!     }
//! }
//! # let _ = peer;
//! ```

mod channel;
mod compress;
mod crc32;
mod host;
mod packet;
mod peer;
mod protocol;
mod queue;
mod socket;
mod util;

#[cfg(test)]
mod test;

pub use crate::compress::{Compressor, RangeCoder};
pub use crate::crc32::crc32;
pub use crate::host::{
    ChecksumFn, Event, Host, Intercept, InterceptFn, PeerId, BANDWIDTH_THROTTLE_INTERVAL,
    DEFAULT_MTU,
};
pub use crate::packet::Packet;
pub use crate::peer::{
    Peer, PeerState, PING_INTERVAL, TIMEOUT_LIMIT, TIMEOUT_MAXIMUM, TIMEOUT_MINIMUM,
};
pub use crate::protocol::{
    MAXIMUM_CHANNEL_COUNT, MAXIMUM_FRAGMENT_COUNT, MAXIMUM_MTU, MAXIMUM_PEER_ID, MINIMUM_MTU,
};
