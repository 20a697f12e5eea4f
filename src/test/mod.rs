//! Tests are implemented in the source tree in order to have access to
//! internal peer and queue state.

mod harness;

mod checksum_compress;
mod fragment;
mod ordering;
mod retransmit;
mod round_trip;
mod soak;
mod timeout;
mod unsequenced;

/// Types that are imported in test modules
mod prelude {
    pub use super::harness::{connected_pair, deadline_passed, init_logging, local, Pair};

    pub use crate::host::{Event, Host, Intercept, PeerId};
    pub use crate::packet::Packet;
    pub use crate::peer::PeerState;

    pub use std::time::{Duration, Instant};
    pub use unwrap::unwrap;
}
