//! Host object and the cooperative service loop.
//!
//! A `Host` owns the socket, a fixed array of peer slots, and the scratch
//! state used to assemble datagrams. All protocol work happens inside
//! `service`, `check_events`, `flush`, and the public peer operations; one
//! thread drives a host, and nothing here blocks except the readiness wait
//! at the bottom of `service`.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::channel::{Channel, FREE_RELIABLE_WINDOWS, RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE};
use crate::compress::{Compressor, RangeCoder};
use crate::packet::Packet;
use crate::peer::{
    self, Inserted, OutgoingCommand, Peer, PeerState, FLAG_CONTINUE_SENDING, FLAG_NEEDS_DISPATCH,
};
use crate::protocol::{
    command_size, Command, CommandBody, ConnectCommand, FragmentCommand, VerifyConnectCommand,
    COMMAND_ACKNOWLEDGE, COMMAND_BANDWIDTH_LIMIT, COMMAND_CONNECT, COMMAND_COUNT,
    COMMAND_DISCONNECT, COMMAND_FLAG_ACKNOWLEDGE, COMMAND_FLAG_UNSEQUENCED, COMMAND_MASK,
    COMMAND_PING, COMMAND_SEND_FRAGMENT, COMMAND_SEND_RELIABLE, COMMAND_SEND_UNRELIABLE,
    COMMAND_SEND_UNRELIABLE_FRAGMENT, COMMAND_SEND_UNSEQUENCED, COMMAND_VERIFY_CONNECT,
    HEADER_FLAG_COMPRESSED, HEADER_FLAG_MASK, HEADER_FLAG_SENT_TIME, HEADER_SESSION_MASK,
    HEADER_SESSION_SHIFT, MAXIMUM_CHANNEL_COUNT, MAXIMUM_FRAGMENT_COUNT, MAXIMUM_MTU,
    MAXIMUM_PACKET_COMMANDS, MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE, MINIMUM_CHANNEL_COUNT,
    MINIMUM_MTU, MINIMUM_WINDOW_SIZE,
};
use crate::socket::{Socket, Wait};
use crate::util::{self, time_diff, time_greater_equal, time_less};

pub const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;
pub const DEFAULT_MTU: u32 = 1400;
pub const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

// Datagrams drained per receive pass before giving the send path a turn.
const RECEIVE_BATCH: usize = 256;

// The service clock starts away from zero; several estimators use zero as
// an "unset" sentinel.
const TIME_BASE_OFFSET: u32 = 1000;

/// Index of a peer slot within its host. Stable for the lifetime of a
/// session; slots are recycled after disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub(crate) usize);

impl PeerId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What `service` and `check_events` hand back to the application.
#[derive(Debug)]
pub enum Event {
    /// A connection handshake completed.
    Connect { peer: PeerId, data: u32 },
    /// A peer disconnected or timed out.
    Disconnect { peer: PeerId, data: u32 },
    /// A payload arrived; ownership of the packet passes to the caller.
    Receive {
        peer: PeerId,
        channel_id: u8,
        packet: Packet,
    },
}

/// Verdict of an intercept callback for one raw datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intercept {
    /// The callback consumed the datagram; skip protocol decoding.
    Consume,
    /// Decode normally.
    Ignore,
    /// Abort the service call with an error.
    Error,
}

pub type ChecksumFn = Box<dyn Fn(&[u8]) -> u32>;
pub type InterceptFn = Box<dyn FnMut(SocketAddr, &[u8]) -> Intercept>;

/// Host state peer logic needs while the peer itself is mutably borrowed.
/// Broken out of `Host` to keep the borrow checker happy.
pub(crate) struct Shared {
    pub socket: Socket,
    pub random: util::Random,
    pub time_base: Instant,
    pub service_time: u32,
    pub mtu: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub bandwidth_throttle_epoch: u32,
    pub recalculate_bandwidth_limits: bool,
    pub channel_limit: usize,
    pub dispatch_queue: VecDeque<usize>,
    pub total_queued: u32,
    pub connected_peers: usize,
    pub bandwidth_limited_peers: usize,
    pub duplicate_peers: usize,
    pub maximum_packet_size: usize,
    pub maximum_waiting_data: usize,
    pub checksum: Option<ChecksumFn>,
    pub compressor: Option<Box<dyn Compressor>>,
    pub intercept: Option<InterceptFn>,
    pub total_sent_data: u32,
    pub total_sent_packets: u32,
    pub total_received_data: u32,
    pub total_received_packets: u32,
}

impl Shared {
    fn time_now(&self) -> u32 {
        util::as_wrapping_millis(self.time_base.elapsed()).wrapping_add(TIME_BASE_OFFSET)
    }
}

pub struct Host {
    shared: Shared,
    peers: Vec<Peer>,
}

/// Scratch for one outgoing datagram: the encoded command bytes plus the
/// running size and flags the MTU budget checks work against.
struct Datagram {
    buf: Vec<u8>,
    command_count: usize,
    packet_size: usize,
    header_flags: u16,
}

impl Datagram {
    fn new() -> Datagram {
        Datagram {
            buf: Vec::with_capacity(MAXIMUM_MTU as usize),
            command_count: 0,
            // Accounted as if the full protocol header were always present.
            packet_size: 4,
            header_flags: 0,
        }
    }

    fn push_command(&mut self, outgoing: &OutgoingCommand) {
        let size = outgoing.command.size();
        let start = self.buf.len();
        self.buf.resize(start + size, 0);
        outgoing.command.encode(&mut self.buf[start..]);
        self.packet_size += size;
        self.command_count += 1;

        if let Some(packet) = &outgoing.packet {
            let data = packet.data();
            let offset = outgoing.fragment_offset as usize;
            let length = usize::from(outgoing.fragment_length);
            self.buf.extend_from_slice(&data[offset..offset + length]);
            self.packet_size += length;
        }
    }
}

impl Host {
    /// Create a host bound to `address` (or an ephemeral port when `None`)
    /// with up to `peer_count` concurrent sessions. Bandwidths of zero mean
    /// unlimited.
    pub fn new(
        address: Option<SocketAddr>,
        peer_count: usize,
        channel_limit: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> io::Result<Host> {
        if peer_count == 0 || peer_count > usize::from(MAXIMUM_PEER_ID) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "peer count out of range",
            ));
        }

        let bind_addr = address.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
        let socket = Socket::bind(bind_addr)?;

        let shared = Shared {
            socket,
            random: util::Random::new(),
            time_base: Instant::now(),
            service_time: 0,
            mtu: DEFAULT_MTU,
            incoming_bandwidth,
            outgoing_bandwidth,
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            channel_limit: clamp_channel_limit(channel_limit),
            dispatch_queue: VecDeque::new(),
            total_queued: 0,
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            duplicate_peers: usize::from(MAXIMUM_PEER_ID),
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            checksum: None,
            compressor: None,
            intercept: None,
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
        };

        let peers = (0..peer_count)
            .map(|index| Peer::new(index as u16, DEFAULT_MTU))
            .collect();

        Ok(Host { shared, peers })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, peer: PeerId) -> &Peer {
        &self.peers[peer.0]
    }

    /// Peers currently in a connected state.
    pub fn connected_peers(&self) -> usize {
        self.shared.connected_peers
    }

    pub fn channel_limit(&self) -> usize {
        self.shared.channel_limit
    }

    /// Limit channels granted to future incoming connections.
    pub fn set_channel_limit(&mut self, channel_limit: usize) {
        self.shared.channel_limit = clamp_channel_limit(channel_limit);
    }

    /// Adjust bandwidth caps; peers are renegotiated on the next throttle
    /// epoch.
    pub fn set_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.shared.incoming_bandwidth = incoming_bandwidth;
        self.shared.outgoing_bandwidth = outgoing_bandwidth;
        self.shared.recalculate_bandwidth_limits = true;
    }

    /// Cap on sessions accepted from one remote IP.
    pub fn set_duplicate_peers(&mut self, duplicate_peers: usize) {
        self.shared.duplicate_peers = duplicate_peers;
    }

    pub fn set_maximum_packet_size(&mut self, maximum_packet_size: usize) {
        self.shared.maximum_packet_size = maximum_packet_size;
    }

    pub fn set_maximum_waiting_data(&mut self, maximum_waiting_data: usize) {
        self.shared.maximum_waiting_data = maximum_waiting_data;
    }

    /// Install or remove the datagram compressor.
    pub fn compress(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.shared.compressor = compressor;
    }

    /// Attach the built-in range coder as the compressor.
    pub fn compress_with_range_coder(&mut self) {
        self.shared.compressor = Some(Box::new(RangeCoder::new()));
    }

    /// Install or remove the datagram checksum.
    pub fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.shared.checksum = checksum;
    }

    /// Install or remove the raw-datagram intercept, called before protocol
    /// decoding.
    pub fn set_intercept(&mut self, intercept: Option<InterceptFn>) {
        self.shared.intercept = intercept;
    }

    pub fn total_sent_data(&self) -> u32 {
        self.shared.total_sent_data
    }

    pub fn total_sent_packets(&self) -> u32 {
        self.shared.total_sent_packets
    }

    pub fn total_received_data(&self) -> u32 {
        self.shared.total_received_data
    }

    pub fn total_received_packets(&self) -> u32 {
        self.shared.total_received_packets
    }

    /// Zero the running traffic counters.
    pub fn reset_totals(&mut self) {
        self.shared.total_sent_data = 0;
        self.shared.total_sent_packets = 0;
        self.shared.total_received_data = 0;
        self.shared.total_received_packets = 0;
    }

    fn random(&mut self) -> u32 {
        self.shared.random.next_u32()
    }

    /// Begin a connection to a foreign host. The returned peer completes
    /// the handshake once `service` reports its `Connect` event.
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> io::Result<PeerId> {
        let channel_count = channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);

        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "no available peer slots")
            })?;

        let connect_id = self.random();
        let outgoing_bandwidth = self.shared.outgoing_bandwidth;
        let incoming_bandwidth = self.shared.incoming_bandwidth;

        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = connect_id;

        peer.window_size = initial_window_size(outgoing_bandwidth);

        debug!(
            "connect; peer={}; addr={:?}; channels={}; connect_id={:08x}",
            index, address, channel_count, connect_id
        );

        let command = Command::new(
            COMMAND_CONNECT | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Connect(ConnectCommand {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id: peer.incoming_session_id,
                outgoing_session_id: peer.outgoing_session_id,
                mtu: peer.mtu,
                window_size: peer.window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth,
                outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id,
                data,
            }),
        );

        self.peers[index].queue_outgoing_command(&mut self.shared, command, None, 0, 0);

        Ok(PeerId(index))
    }

    /// Queue `packet` for delivery to `peer` on `channel_id`. On failure
    /// the caller keeps ownership and nothing was queued.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> io::Result<()> {
        self.peers[peer.0]
            .send(&mut self.shared, channel_id, packet)
            .map_err(|()| {
                io::Error::new(io::ErrorKind::InvalidInput, "packet could not be queued")
            })
    }

    /// Queue `packet` to every connected peer.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        for index in 0..self.peers.len() {
            if self.peers[index].state != PeerState::Connected {
                continue;
            }
            let _ = self.peers[index].send(&mut self.shared, channel_id, packet.clone());
        }
    }

    /// Send a ping; pings also go out automatically on idle connections.
    pub fn ping(&mut self, peer: PeerId) {
        self.peers[peer.0].ping(&mut self.shared);
    }

    /// Interval between automatic pings, used to keep the throttle
    /// responsive during idle periods. Zero restores the default.
    pub fn set_ping_interval(&mut self, peer: PeerId, interval: u32) {
        self.peers[peer.0].set_ping_interval(interval);
    }

    /// Per-peer retransmission budgets; zeroes restore the defaults.
    pub fn set_timeout(&mut self, peer: PeerId, limit: u32, minimum: u32, maximum: u32) {
        self.peers[peer.0].set_timeout(limit, minimum, maximum);
    }

    /// Reconfigure the unreliable-traffic throttle and tell the remote end.
    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) {
        self.peers[peer.0].throttle_configure(&mut self.shared, interval, acceleration, deceleration);
    }

    /// Request a graceful disconnect; a `Disconnect` event follows once the
    /// remote end acknowledges.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) {
        self.peer_disconnect(peer.0, data);
    }

    /// Disconnect once every queued outgoing packet has been sent.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        if (self.peers[index].state == PeerState::Connected
            || self.peers[index].state == PeerState::DisconnectLater)
            && self.peers[index].has_outgoing_commands()
        {
            self.peers[index].state = PeerState::DisconnectLater;
            self.peers[index].event_data = data;
        } else {
            self.peer_disconnect(index, data);
        }
    }

    /// Disconnect immediately: the notification is sent once, unreliably,
    /// and no `Disconnect` event is generated locally.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) {
        let index = peer.0;
        if self.peers[index].state == PeerState::Disconnected {
            return;
        }

        if self.peers[index].state != PeerState::Zombie
            && self.peers[index].state != PeerState::Disconnecting
        {
            self.peers[index].reset_queues(&mut self.shared);

            let command = Command::new(
                COMMAND_DISCONNECT | COMMAND_FLAG_UNSEQUENCED,
                0xFF,
                CommandBody::Disconnect { data },
            );
            self.peers[index].queue_outgoing_command(&mut self.shared, command, None, 0, 0);
            let _ = self.flush();
        }

        self.peers[index].reset(&mut self.shared);
    }

    /// Forcefully reset a peer slot with no notification to either side.
    pub fn reset_peer(&mut self, peer: PeerId) {
        self.peers[peer.0].reset(&mut self.shared);
    }

    fn peer_disconnect(&mut self, index: usize, data: u32) {
        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return;
        }

        self.peers[index].reset_queues(&mut self.shared);

        let mut command = Command::new(COMMAND_DISCONNECT, 0xFF, CommandBody::Disconnect { data });
        let graceful = state == PeerState::Connected || state == PeerState::DisconnectLater;
        if graceful {
            command.header.command |= COMMAND_FLAG_ACKNOWLEDGE;
        } else {
            command.header.command |= COMMAND_FLAG_UNSEQUENCED;
        }

        self.peers[index].queue_outgoing_command(&mut self.shared, command, None, 0, 0);

        if graceful {
            self.peers[index].on_disconnect(&mut self.shared);
            self.peers[index].state = PeerState::Disconnecting;
        } else {
            let _ = self.flush();
            self.peers[index].reset(&mut self.shared);
        }
    }

    /// Dispatch one pending event without touching the socket.
    pub fn check_events(&mut self) -> Option<Event> {
        let mut event = None;
        self.dispatch_incoming_commands(&mut event);
        event
    }

    /// Send any queued packets without waiting for events.
    pub fn flush(&mut self) -> io::Result<()> {
        self.shared.service_time = self.shared.time_now();
        let mut event = None;
        self.send_outgoing_commands(&mut event, false, false)?;
        Ok(())
    }

    /// Run the protocol: deliver pending events, exchange datagrams, retry
    /// timed-out reliable commands, and wait up to `timeout` milliseconds
    /// for something to happen. Returns `None` when the timeout elapses
    /// without an event.
    pub fn service(&mut self, timeout: u32) -> io::Result<Option<Event>> {
        let mut event = None;

        if self.dispatch_incoming_commands(&mut event) {
            return Ok(event);
        }

        self.shared.service_time = self.shared.time_now();
        let deadline = self.shared.service_time.wrapping_add(timeout);

        loop {
            if time_diff(self.shared.service_time, self.shared.bandwidth_throttle_epoch)
                >= BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            if self.send_outgoing_commands(&mut event, true, true)? {
                return Ok(event);
            }
            if self.receive_incoming_commands(&mut event)? {
                return Ok(event);
            }
            if self.send_outgoing_commands(&mut event, true, true)? {
                return Ok(event);
            }
            if self.dispatch_incoming_commands(&mut event) {
                return Ok(event);
            }

            if time_greater_equal(self.shared.service_time, deadline) {
                return Ok(None);
            }

            loop {
                self.shared.service_time = self.shared.time_now();
                if time_greater_equal(self.shared.service_time, deadline) {
                    return Ok(None);
                }

                match self
                    .shared
                    .socket
                    .wait(time_diff(deadline, self.shared.service_time))?
                {
                    Wait::Interrupted => continue,
                    Wait::TimedOut => return Ok(None),
                    Wait::Readable => break,
                }
            }

            self.shared.service_time = self.shared.time_now();
        }
    }

    // ---- dispatch ----

    fn dispatch_incoming_commands(&mut self, event: &mut Option<Event>) -> bool {
        while let Some(index) = self.shared.dispatch_queue.pop_front() {
            let state = {
                let peer = &mut self.peers[index];
                peer.flags &= !FLAG_NEEDS_DISPATCH;
                peer.state
            };

            match state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.peers[index].change_state(&mut self.shared, PeerState::Connected);
                    *event = Some(Event::Connect {
                        peer: PeerId(index),
                        data: self.peers[index].event_data,
                    });
                    return true;
                }
                PeerState::Zombie => {
                    self.shared.recalculate_bandwidth_limits = true;
                    let data = self.peers[index].event_data;
                    self.peers[index].reset(&mut self.shared);
                    *event = Some(Event::Disconnect {
                        peer: PeerId(index),
                        data,
                    });
                    return true;
                }
                PeerState::Connected => {
                    let Some((channel_id, packet)) = self.peers[index].receive() else {
                        continue;
                    };
                    if !self.peers[index].dispatched_commands.is_empty() {
                        self.peers[index].mark_needs_dispatch(&mut self.shared);
                    }
                    *event = Some(Event::Receive {
                        peer: PeerId(index),
                        channel_id,
                        packet,
                    });
                    return true;
                }
                _ => {}
            }
        }
        false
    }

    fn notify_connect(&mut self, index: usize, event: &mut Option<Event>, deliver: bool) {
        self.shared.recalculate_bandwidth_limits = true;

        if deliver && event.is_none() {
            self.peers[index].change_state(&mut self.shared, PeerState::Connected);
            *event = Some(Event::Connect {
                peer: PeerId(index),
                data: self.peers[index].event_data,
            });
        } else {
            let state = if self.peers[index].state == PeerState::Connecting {
                PeerState::ConnectionSucceeded
            } else {
                PeerState::ConnectionPending
            };
            self.peers[index].dispatch_state(&mut self.shared, state);
        }
    }

    fn notify_disconnect(&mut self, index: usize, event: &mut Option<Event>, deliver: bool) {
        let state = self.peers[index].state;

        if state as u32 >= PeerState::ConnectionPending as u32 {
            self.shared.recalculate_bandwidth_limits = true;
        }

        if state != PeerState::Connecting
            && (state as u32) < PeerState::ConnectionSucceeded as u32
        {
            self.peers[index].reset(&mut self.shared);
        } else if deliver && event.is_none() {
            self.peers[index].reset(&mut self.shared);
            *event = Some(Event::Disconnect {
                peer: PeerId(index),
                data: 0,
            });
        } else {
            self.peers[index].event_data = 0;
            self.peers[index].dispatch_state(&mut self.shared, PeerState::Zombie);
        }
    }

    // ---- send path ----

    fn send_outgoing_commands(
        &mut self,
        event: &mut Option<Event>,
        deliver: bool,
        check_for_timeouts: bool,
    ) -> io::Result<bool> {
        let mut send_pass = 0;
        let mut continue_sending = 0;

        while send_pass <= continue_sending {
            for index in 0..self.peers.len() {
                {
                    let peer = &self.peers[index];
                    if peer.state == PeerState::Disconnected || peer.state == PeerState::Zombie {
                        continue;
                    }
                    if send_pass > 0 && peer.flags & FLAG_CONTINUE_SENDING == 0 {
                        continue;
                    }
                }
                self.peers[index].flags &= !FLAG_CONTINUE_SENDING;

                if self.send_to_peer(index, event, deliver, check_for_timeouts)? {
                    return Ok(true);
                }

                if self.peers[index].flags & FLAG_CONTINUE_SENDING != 0 {
                    continue_sending = send_pass + 1;
                }
            }
            send_pass += 1;
        }

        Ok(false)
    }

    /// Assemble and transmit at most one datagram to one peer. Returns true
    /// when a timeout produced a deliverable event.
    fn send_to_peer(
        &mut self,
        index: usize,
        event: &mut Option<Event>,
        deliver: bool,
        check_for_timeouts: bool,
    ) -> io::Result<bool> {
        let service_time = self.shared.service_time;
        let mut dgram = Datagram::new();

        if !self.peers[index].acknowledgements.is_empty() {
            self.send_acknowledgements(index, &mut dgram);
        }

        if check_for_timeouts
            && !self.peers[index].sent_reliable_commands.is_empty()
            && time_greater_equal(service_time, self.peers[index].next_timeout)
            && self.peers[index].check_timeouts(service_time)
        {
            self.notify_disconnect(index, event, deliver);
            if deliver && event.is_some() {
                return Ok(true);
            }
            return Ok(false);
        }

        let has_outgoing = !self.peers[index].outgoing_commands.is_empty()
            || !self.peers[index].outgoing_send_reliable_commands.is_empty();
        let can_ping = if has_outgoing {
            self.check_outgoing_commands(index, &mut dgram)
        } else {
            true
        };

        if can_ping
            && self.peers[index].sent_reliable_commands.is_empty()
            && time_diff(service_time, self.peers[index].last_receive_time)
                >= self.peers[index].ping_interval
            && (self.peers[index].mtu as usize).saturating_sub(dgram.packet_size)
                >= command_size(COMMAND_PING)
        {
            self.peers[index].ping(&mut self.shared);
            self.check_outgoing_commands(index, &mut dgram);
        }

        if dgram.command_count == 0 {
            return Ok(false);
        }

        // Roll the loss statistics forward once per interval.
        {
            let peer = &mut self.peers[index];
            if peer.packet_loss_epoch == 0 {
                peer.packet_loss_epoch = service_time;
            } else if time_diff(service_time, peer.packet_loss_epoch) >= peer::PACKET_LOSS_INTERVAL
                && peer.packets_sent > 0
            {
                let packet_loss = (u64::from(peer.packets_lost)
                    * u64::from(peer::PACKET_LOSS_SCALE)
                    / u64::from(peer.packets_sent)) as u32;

                peer.packet_loss_variance = (peer.packet_loss_variance * 3
                    + packet_loss.abs_diff(peer.packet_loss))
                    / 4;
                peer.packet_loss = (peer.packet_loss * 7 + packet_loss) / 8;

                trace!(
                    "loss stats; peer={}; loss={}/{}; rtt={}±{}",
                    index,
                    peer.packet_loss,
                    peer::PACKET_LOSS_SCALE,
                    peer.round_trip_time,
                    peer.round_trip_time_variance
                );

                peer.packet_loss_epoch = service_time;
                peer.packets_sent = 0;
                peer.packets_lost = 0;
            }
        }

        // Compress the command region when the compressor actually shrinks
        // it; the checksum always covers the uncompressed image.
        let mut compressed: Option<Vec<u8>> = None;
        if let Some(compressor) = &mut self.shared.compressor {
            let mut out = vec![0u8; dgram.buf.len()];
            let size = compressor.compress(&dgram.buf, &mut out);
            if size > 0 && size < dgram.buf.len() {
                out.truncate(size);
                dgram.header_flags |= HEADER_FLAG_COMPRESSED;
                compressed = Some(out);
            }
        }

        let (outgoing_peer_id, outgoing_session_id, connect_id, address) = {
            let peer = &self.peers[index];
            (
                peer.outgoing_peer_id,
                peer.outgoing_session_id,
                peer.connect_id,
                peer.address,
            )
        };

        let mut header_flags = dgram.header_flags;
        if outgoing_peer_id < MAXIMUM_PEER_ID {
            header_flags |= u16::from(outgoing_session_id) << HEADER_SESSION_SHIFT;
        }

        let mut send_buf = Vec::with_capacity(dgram.buf.len() + 8);
        send_buf.extend_from_slice(&(outgoing_peer_id | header_flags).to_be_bytes());
        if header_flags & HEADER_FLAG_SENT_TIME != 0 {
            send_buf.extend_from_slice(&((service_time & 0xFFFF) as u16).to_be_bytes());
        }

        let checksum_offset = if self.shared.checksum.is_some() {
            let offset = send_buf.len();
            let seed = if outgoing_peer_id < MAXIMUM_PEER_ID {
                connect_id
            } else {
                0
            };
            send_buf.extend_from_slice(&seed.to_be_bytes());
            Some(offset)
        } else {
            None
        };

        let head_len = send_buf.len();
        send_buf.extend_from_slice(&dgram.buf);

        if let (Some(offset), Some(checksum)) = (checksum_offset, self.shared.checksum.as_ref()) {
            let value = checksum(&send_buf);
            BigEndian::write_u32(&mut send_buf[offset..offset + 4], value);
        }

        if let Some(compressed) = compressed {
            send_buf.truncate(head_len);
            send_buf.extend_from_slice(&compressed);
        }

        self.peers[index].last_send_time = service_time;

        let address = address.expect("sending to a peer with no address");
        let sent = self.shared.socket.send_to(&send_buf, address);

        if self.peers[index].remove_sent_unreliable_commands() {
            let data = self.peers[index].event_data;
            self.peer_disconnect(index, data);
        }

        let sent = sent?;
        self.shared.total_sent_data = self.shared.total_sent_data.wrapping_add(sent as u32);
        self.shared.total_sent_packets = self.shared.total_sent_packets.wrapping_add(1);

        Ok(false)
    }

    fn send_acknowledgements(&mut self, index: usize, dgram: &mut Datagram) {
        loop {
            let acknowledgement = {
                let peer = &mut self.peers[index];
                if peer.acknowledgements.is_empty() {
                    break;
                }
                if dgram.command_count >= MAXIMUM_PACKET_COMMANDS
                    || (peer.mtu as usize).saturating_sub(dgram.packet_size)
                        < command_size(COMMAND_ACKNOWLEDGE)
                {
                    peer.flags |= FLAG_CONTINUE_SENDING;
                    break;
                }
                peer.acknowledgements.pop_front().unwrap()
            };

            let mut command = Command::new(
                COMMAND_ACKNOWLEDGE,
                acknowledgement.command.channel_id,
                CommandBody::Acknowledge {
                    received_reliable_sequence_number: acknowledgement
                        .command
                        .reliable_sequence_number,
                    received_sent_time: acknowledgement.sent_time as u16,
                },
            );
            command.header.reliable_sequence_number =
                acknowledgement.command.reliable_sequence_number;

            let outgoing = OutgoingCommand {
                command,
                packet: None,
                fragment_offset: 0,
                fragment_length: 0,
                reliable_sequence_number: 0,
                unreliable_sequence_number: 0,
                sent_time: 0,
                round_trip_timeout: 0,
                queue_time: 0,
                send_attempts: 0,
            };
            dgram.push_command(&outgoing);

            if acknowledgement.command.command & COMMAND_MASK == COMMAND_DISCONNECT {
                self.peers[index].dispatch_state(&mut self.shared, PeerState::Zombie);
            }
        }
    }

    /// Gather queued commands into the datagram under the MTU and window
    /// budgets. Returns false when a reliable command went out (suppressing
    /// the keepalive ping).
    fn check_outgoing_commands(&mut self, index: usize, dgram: &mut Datagram) -> bool {
        let service_time = self.shared.service_time;
        let can_ping = {
            let peer = &mut self.peers[index];

            let mut current_command = peer.outgoing_commands.front();
            let mut current_send_reliable = peer.outgoing_send_reliable_commands.front();
            let mut window_wrap = false;
            let mut can_ping = true;

            loop {
                #[derive(Clone, Copy, PartialEq)]
                enum Source {
                    Outgoing,
                    SendReliable,
                }

                let (item, source) = match (current_command, current_send_reliable) {
                    (Some(command), Some(send_reliable)) => {
                        if time_less(
                            peer.outgoing_arena[send_reliable].queue_time,
                            peer.outgoing_arena[command].queue_time,
                        ) {
                            current_send_reliable = peer.outgoing_arena.next_of(send_reliable);
                            (send_reliable, Source::SendReliable)
                        } else {
                            current_command = peer.outgoing_arena.next_of(command);
                            (command, Source::Outgoing)
                        }
                    }
                    (Some(command), None) => {
                        current_command = peer.outgoing_arena.next_of(command);
                        (command, Source::Outgoing)
                    }
                    (None, Some(send_reliable)) => {
                        current_send_reliable = peer.outgoing_arena.next_of(send_reliable);
                        (send_reliable, Source::SendReliable)
                    }
                    (None, None) => break,
                };

                let acknowledged =
                    peer.outgoing_arena[item].command.header.command & COMMAND_FLAG_ACKNOWLEDGE != 0;
                let mut channel_window: Option<(usize, u16)> = None;

                if acknowledged {
                    let channel_id = peer.outgoing_arena[item].command.header.channel_id;
                    let sequence_number = peer.outgoing_arena[item].reliable_sequence_number;
                    let reliable_window = sequence_number / RELIABLE_WINDOW_SIZE;

                    if usize::from(channel_id) < peer.channels.len() {
                        if window_wrap {
                            continue;
                        }

                        let channel = &peer.channels[usize::from(channel_id)];
                        let send_attempts = peer.outgoing_arena[item].send_attempts;
                        if send_attempts < 1
                            && sequence_number % RELIABLE_WINDOW_SIZE == 0
                            && (channel.reliable_windows[usize::from(
                                (reliable_window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS,
                            )] >= RELIABLE_WINDOW_SIZE
                                || u32::from(channel.used_reliable_windows)
                                    & window_wrap_mask(reliable_window)
                                    != 0)
                        {
                            // Starting a fresh window while its neighborhood
                            // is still occupied would let sequence numbers
                            // lap themselves.
                            window_wrap = true;
                            current_send_reliable = None;
                            continue;
                        }

                        channel_window = Some((usize::from(channel_id), reliable_window));
                    }

                    if peer.outgoing_arena[item].packet.is_some() {
                        let window_size =
                            peer.packet_throttle * peer.window_size / peer::PACKET_THROTTLE_SCALE;
                        let fragment_length =
                            u32::from(peer.outgoing_arena[item].fragment_length);

                        if peer.reliable_data_in_transit + fragment_length
                            > window_size.max(peer.mtu)
                        {
                            current_send_reliable = None;
                            continue;
                        }
                    }

                    can_ping = false;
                }

                let size = command_size(peer.outgoing_arena[item].command.header.command);
                let budget = (peer.mtu as usize).saturating_sub(dgram.packet_size);
                let needs = if peer.outgoing_arena[item].packet.is_some() {
                    size + usize::from(peer.outgoing_arena[item].fragment_length)
                } else {
                    size
                };
                if dgram.command_count >= MAXIMUM_PACKET_COMMANDS || budget < needs {
                    peer.flags |= FLAG_CONTINUE_SENDING;
                    break;
                }

                if acknowledged {
                    let mut outgoing = match source {
                        Source::Outgoing => {
                            peer.outgoing_commands.remove(&mut peer.outgoing_arena, item)
                        }
                        Source::SendReliable => peer
                            .outgoing_send_reliable_commands
                            .remove(&mut peer.outgoing_arena, item),
                    };

                    if let Some((channel_index, reliable_window)) = channel_window {
                        if outgoing.send_attempts < 1 {
                            let channel = &mut peer.channels[channel_index];
                            channel.used_reliable_windows |= 1 << reliable_window;
                            channel.reliable_windows[usize::from(reliable_window)] += 1;
                        }
                    }

                    outgoing.send_attempts += 1;
                    if outgoing.round_trip_timeout == 0 {
                        outgoing.round_trip_timeout =
                            peer.round_trip_time + 4 * peer.round_trip_time_variance;
                    }
                    if peer.sent_reliable_commands.is_empty() {
                        peer.next_timeout = service_time.wrapping_add(outgoing.round_trip_timeout);
                    }

                    outgoing.sent_time = service_time;
                    dgram.header_flags |= HEADER_FLAG_SENT_TIME;
                    peer.reliable_data_in_transit += u32::from(outgoing.fragment_length);

                    dgram.push_command(&outgoing);
                    peer.packets_sent = peer.packets_sent.wrapping_add(1);

                    peer.sent_reliable_commands
                        .push_back(&mut peer.outgoing_arena, outgoing);
                } else {
                    debug_assert!(source == Source::Outgoing);

                    // Unreliable payloads roll the throttle dice; a losing
                    // roll drops the packet and every co-sequenced fragment
                    // behind it.
                    if peer.outgoing_arena[item].packet.is_some()
                        && peer.outgoing_arena[item].fragment_offset == 0
                    {
                        peer.packet_throttle_counter += peer::PACKET_THROTTLE_COUNTER;
                        peer.packet_throttle_counter %= peer::PACKET_THROTTLE_SCALE;

                        if peer.packet_throttle_counter > peer.packet_throttle {
                            let reliable_sequence_number =
                                peer.outgoing_arena[item].reliable_sequence_number;
                            let unreliable_sequence_number =
                                peer.outgoing_arena[item].unreliable_sequence_number;

                            trace!(
                                "throttle drop; peer={}; unreliable_seq={}",
                                index,
                                unreliable_sequence_number
                            );

                            let mut drop_item = item;
                            loop {
                                let outgoing = peer
                                    .outgoing_commands
                                    .remove(&mut peer.outgoing_arena, drop_item);
                                if let Some(packet) = outgoing.packet {
                                    Packet::release(packet);
                                }

                                let next = match current_command {
                                    Some(next) => next,
                                    None => break,
                                };
                                if peer.outgoing_arena[next].reliable_sequence_number
                                    != reliable_sequence_number
                                    || peer.outgoing_arena[next].unreliable_sequence_number
                                        != unreliable_sequence_number
                                {
                                    break;
                                }
                                drop_item = next;
                                current_command = peer.outgoing_arena.next_of(next);
                            }

                            continue;
                        }
                    }

                    let outgoing =
                        peer.outgoing_commands.remove(&mut peer.outgoing_arena, item);
                    dgram.push_command(&outgoing);
                    peer.packets_sent = peer.packets_sent.wrapping_add(1);

                    if outgoing.packet.is_some() {
                        peer.sent_unreliable_commands
                            .push_back(&mut peer.outgoing_arena, outgoing);
                    }
                }
            }

            can_ping
        };

        if self.peers[index].state == PeerState::DisconnectLater
            && !self.peers[index].has_outgoing_commands()
            && self.peers[index].sent_unreliable_commands.is_empty()
        {
            let data = self.peers[index].event_data;
            self.peer_disconnect(index, data);
        }

        can_ping
    }

    // ---- receive path ----

    fn receive_incoming_commands(&mut self, event: &mut Option<Event>) -> io::Result<bool> {
        let mut buf = [0u8; MAXIMUM_MTU as usize];

        for _ in 0..RECEIVE_BATCH {
            let (length, address) = match self.shared.socket.recv_from(&mut buf)? {
                Some(received) => received,
                None => return Ok(false),
            };

            self.shared.total_received_data =
                self.shared.total_received_data.wrapping_add(length as u32);
            self.shared.total_received_packets =
                self.shared.total_received_packets.wrapping_add(1);

            if let Some(intercept) = &mut self.shared.intercept {
                match intercept(address, &buf[..length]) {
                    Intercept::Consume => continue,
                    Intercept::Error => {
                        return Err(io::Error::new(
                            io::ErrorKind::Other,
                            "intercept rejected datagram",
                        ))
                    }
                    Intercept::Ignore => {}
                }
            }

            self.handle_datagram(&buf[..length], address, event)?;
            if event.is_some() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn handle_datagram(
        &mut self,
        data: &[u8],
        address: SocketAddr,
        event: &mut Option<Event>,
    ) -> io::Result<()> {
        if data.len() < 2 {
            return Ok(());
        }

        let raw = BigEndian::read_u16(&data[..2]);
        let session_id = ((raw & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8;
        let flags = raw & HEADER_FLAG_MASK;
        let peer_id = raw & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK);

        let mut header_size = if flags & HEADER_FLAG_SENT_TIME != 0 { 4 } else { 2 };
        if self.shared.checksum.is_some() {
            header_size += 4;
        }
        if data.len() < header_size {
            return Ok(());
        }

        let sent_time = if flags & HEADER_FLAG_SENT_TIME != 0 {
            BigEndian::read_u16(&data[2..4])
        } else {
            0
        };

        let mut peer_index: Option<usize> = if peer_id == MAXIMUM_PEER_ID {
            None
        } else if usize::from(peer_id) >= self.peers.len() {
            return Ok(());
        } else {
            let peer = &self.peers[usize::from(peer_id)];
            let address_matches = match peer.address {
                Some(peer_address) => peer_address == address || is_broadcast(&peer_address),
                None => false,
            };
            if peer.state == PeerState::Disconnected
                || peer.state == PeerState::Zombie
                || !address_matches
                || (peer.outgoing_peer_id < MAXIMUM_PEER_ID
                    && session_id != peer.incoming_session_id)
            {
                trace!(
                    "rejecting datagram; peer={}; state={:?}; addr={:?}",
                    peer_id,
                    peer.state,
                    address
                );
                return Ok(());
            }
            Some(usize::from(peer_id))
        };

        // Decompress into an owned buffer, preserving the header bytes.
        let decompressed: Option<Vec<u8>> = if flags & HEADER_FLAG_COMPRESSED != 0 {
            let Some(compressor) = &mut self.shared.compressor else {
                return Ok(());
            };
            let mut out = vec![0u8; MAXIMUM_MTU as usize];
            let original_size =
                compressor.decompress(&data[header_size..], &mut out[header_size..]);
            if original_size == 0 || original_size > MAXIMUM_MTU as usize - header_size {
                return Ok(());
            }
            out[..header_size].copy_from_slice(&data[..header_size]);
            out.truncate(header_size + original_size);
            Some(out)
        } else {
            None
        };
        let working: &[u8] = decompressed.as_deref().unwrap_or(data);

        if let Some(checksum) = &self.shared.checksum {
            let offset = header_size - 4;
            let declared = BigEndian::read_u32(&working[offset..offset + 4]);
            let seed = match peer_index {
                Some(index) => self.peers[index].connect_id,
                None => 0,
            };

            let mut seeded = working.to_vec();
            BigEndian::write_u32(&mut seeded[offset..offset + 4], seed);

            if checksum(&seeded) != declared {
                trace!("checksum mismatch; peer={:?}; addr={:?}", peer_index, address);
                return Ok(());
            }
        }

        if let Some(index) = peer_index {
            let peer = &mut self.peers[index];
            peer.address = Some(address);
            peer.incoming_data_total = peer.incoming_data_total.wrapping_add(working.len() as u32);
        }

        let mut current = header_size;
        while current + 4 <= working.len() {
            let command_byte = working[current];
            let kind = command_byte & COMMAND_MASK;
            if kind >= COMMAND_COUNT {
                break;
            }
            let size = command_size(command_byte);
            if size == 0 || current + size > working.len() {
                break;
            }

            let command = match Command::decode(&working[current..]) {
                Some(command) => command,
                None => break,
            };
            current += size;

            if peer_index.is_none() && kind != COMMAND_CONNECT {
                break;
            }

            // Variable-length sends carry their payload inline after the
            // command record.
            let payload: Option<&[u8]> = match payload_length(&command) {
                Some(length) => {
                    if length > self.shared.maximum_packet_size
                        || current + length > working.len()
                    {
                        break;
                    }
                    let payload = &working[current..current + length];
                    current += length;
                    Some(payload)
                }
                None => None,
            };

            let handled: Result<(), ()> = match kind {
                COMMAND_ACKNOWLEDGE => {
                    let Some(index) = peer_index else { break };
                    self.handle_acknowledge(index, &command, event, true)
                }
                COMMAND_CONNECT => {
                    if peer_index.is_some() {
                        break;
                    }
                    match self.handle_connect(address, &command) {
                        Some(index) => {
                            peer_index = Some(index);
                            Ok(())
                        }
                        None => Err(()),
                    }
                }
                COMMAND_VERIFY_CONNECT => {
                    let Some(index) = peer_index else { break };
                    self.handle_verify_connect(index, &command, event, true)
                }
                COMMAND_DISCONNECT => {
                    let Some(index) = peer_index else { break };
                    self.handle_disconnect(index, &command)
                }
                COMMAND_PING => {
                    let Some(index) = peer_index else { break };
                    self.handle_ping(index)
                }
                COMMAND_SEND_RELIABLE => {
                    let Some(index) = peer_index else { break };
                    self.handle_send_reliable(index, &command, payload.unwrap())
                }
                COMMAND_SEND_UNRELIABLE => {
                    let Some(index) = peer_index else { break };
                    self.handle_send_unreliable(index, &command, payload.unwrap())
                }
                COMMAND_SEND_UNSEQUENCED => {
                    let Some(index) = peer_index else { break };
                    self.handle_send_unsequenced(index, &command, payload.unwrap())
                }
                COMMAND_SEND_FRAGMENT => {
                    let Some(index) = peer_index else { break };
                    self.handle_send_fragment(index, &command, payload.unwrap())
                }
                COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                    let Some(index) = peer_index else { break };
                    self.handle_send_unreliable_fragment(index, &command, payload.unwrap())
                }
                COMMAND_BANDWIDTH_LIMIT => {
                    let Some(index) = peer_index else { break };
                    self.handle_bandwidth_limit(index, &command)
                }
                COMMAND_THROTTLE_CONFIGURE => {
                    let Some(index) = peer_index else { break };
                    self.handle_throttle_configure(index, &command)
                }
                _ => Err(()),
            };

            if handled.is_err() {
                // A malformed command poisons the rest of the datagram, not
                // the session.
                break;
            }

            if let Some(index) = peer_index {
                if command_byte & COMMAND_FLAG_ACKNOWLEDGE != 0 {
                    if flags & HEADER_FLAG_SENT_TIME == 0 {
                        break;
                    }

                    match self.peers[index].state {
                        PeerState::Disconnecting
                        | PeerState::AcknowledgingConnect
                        | PeerState::Disconnected
                        | PeerState::Zombie => {}
                        PeerState::AcknowledgingDisconnect => {
                            if kind == COMMAND_DISCONNECT {
                                self.peers[index]
                                    .queue_acknowledgement(&command.header, sent_time);
                            }
                        }
                        _ => {
                            self.peers[index].queue_acknowledgement(&command.header, sent_time);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_acknowledge(
        &mut self,
        index: usize,
        command: &Command,
        event: &mut Option<Event>,
        deliver: bool,
    ) -> Result<(), ()> {
        let service_time = self.shared.service_time;

        {
            let peer = &self.peers[index];
            if peer.state == PeerState::Disconnected || peer.state == PeerState::Zombie {
                return Ok(());
            }
        }

        let CommandBody::Acknowledge {
            received_reliable_sequence_number,
            received_sent_time,
        } = command.body
        else {
            return Err(());
        };

        // The 16-bit echoed timestamp extends with the service clock's high
        // half, stepping back one lap when it straddles a rollover.
        let mut received_sent_time = u32::from(received_sent_time);
        received_sent_time |= service_time & 0xFFFF_0000;
        if (received_sent_time & 0x8000) > (service_time & 0x8000) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }

        if time_less(service_time, received_sent_time) {
            return Ok(());
        }

        let round_trip_time = time_diff(service_time, received_sent_time).max(1);

        let command_number = {
            let peer = &mut self.peers[index];

            if peer.last_receive_time > 0 {
                peer.throttle(round_trip_time);

                peer.round_trip_time_variance -= peer.round_trip_time_variance / 4;

                if round_trip_time >= peer.round_trip_time {
                    let diff = round_trip_time - peer.round_trip_time;
                    peer.round_trip_time_variance += diff / 4;
                    peer.round_trip_time += diff / 8;
                } else {
                    let diff = peer.round_trip_time - round_trip_time;
                    peer.round_trip_time_variance += diff / 4;
                    peer.round_trip_time -= diff / 8;
                }
            } else {
                peer.round_trip_time = round_trip_time;
                peer.round_trip_time_variance = (round_trip_time + 1) / 2;
            }

            if peer.round_trip_time < peer.lowest_round_trip_time {
                peer.lowest_round_trip_time = peer.round_trip_time;
            }
            if peer.round_trip_time_variance > peer.highest_round_trip_time_variance {
                peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
            }

            if peer.packet_throttle_epoch == 0
                || time_diff(service_time, peer.packet_throttle_epoch)
                    >= peer.packet_throttle_interval
            {
                peer.last_round_trip_time = peer.lowest_round_trip_time;
                peer.last_round_trip_time_variance = peer.highest_round_trip_time_variance.max(1);
                peer.lowest_round_trip_time = peer.round_trip_time;
                peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
                peer.packet_throttle_epoch = service_time;
            }

            peer.last_receive_time = service_time.max(1);
            peer.earliest_timeout = 0;

            peer.remove_sent_reliable_command(
                received_reliable_sequence_number,
                command.header.channel_id,
            )
        };

        match self.peers[index].state {
            PeerState::AcknowledgingConnect => {
                if command_number != COMMAND_VERIFY_CONNECT {
                    return Err(());
                }
                self.notify_connect(index, event, deliver);
            }
            PeerState::Disconnecting => {
                if command_number != COMMAND_DISCONNECT {
                    return Err(());
                }
                self.notify_disconnect(index, event, deliver);
            }
            PeerState::DisconnectLater => {
                if !self.peers[index].has_outgoing_commands() {
                    let data = self.peers[index].event_data;
                    self.peer_disconnect(index, data);
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn handle_connect(&mut self, address: SocketAddr, command: &Command) -> Option<usize> {
        let CommandBody::Connect(connect) = command.body else {
            return None;
        };

        let mut channel_count = connect.channel_count as usize;
        if channel_count < MINIMUM_CHANNEL_COUNT || channel_count > MAXIMUM_CHANNEL_COUNT {
            return None;
        }

        let mut slot = None;
        let mut duplicate_peers = 0;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if slot.is_none() {
                    slot = Some(index);
                }
            } else if peer.state != PeerState::Connecting
                && peer.address.map(|a| a.ip()) == Some(address.ip())
            {
                if peer.address.map(|a| a.port()) == Some(address.port())
                    && peer.connect_id == connect.connect_id
                {
                    // Retransmitted CONNECT for a session already set up.
                    return None;
                }
                duplicate_peers += 1;
            }
        }

        let index = slot?;
        if duplicate_peers >= self.shared.duplicate_peers {
            return None;
        }

        if channel_count > self.shared.channel_limit {
            channel_count = self.shared.channel_limit;
        }

        debug!(
            "incoming connect; peer={}; addr={:?}; channels={}; connect_id={:08x}",
            index, address, channel_count, connect.connect_id
        );

        let host_incoming_bandwidth = self.shared.incoming_bandwidth;
        let host_outgoing_bandwidth = self.shared.outgoing_bandwidth;

        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = connect.connect_id;
        peer.address = Some(address);
        peer.outgoing_peer_id = connect.outgoing_peer_id;
        peer.incoming_bandwidth = connect.incoming_bandwidth;
        peer.outgoing_bandwidth = connect.outgoing_bandwidth;
        peer.packet_throttle_interval = connect.packet_throttle_interval;
        peer.packet_throttle_acceleration = connect.packet_throttle_acceleration;
        peer.packet_throttle_deceleration = connect.packet_throttle_deceleration;
        peer.event_data = connect.data;

        // Bump both session nonces past the ones the remote end proposed so
        // datagrams from any earlier incarnation fail the session check.
        let session_shift = HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT;
        let mut incoming_session_id = if connect.incoming_session_id == 0xFF {
            peer.outgoing_session_id
        } else {
            connect.incoming_session_id
        };
        incoming_session_id = incoming_session_id.wrapping_add(1) & session_shift as u8;
        if incoming_session_id == peer.outgoing_session_id {
            incoming_session_id = incoming_session_id.wrapping_add(1) & session_shift as u8;
        }
        peer.outgoing_session_id = incoming_session_id;

        let mut outgoing_session_id = if connect.outgoing_session_id == 0xFF {
            peer.incoming_session_id
        } else {
            connect.outgoing_session_id
        };
        outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_shift as u8;
        if outgoing_session_id == peer.incoming_session_id {
            outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_shift as u8;
        }
        peer.incoming_session_id = outgoing_session_id;

        let mtu = connect.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        peer.window_size = if host_outgoing_bandwidth == 0 && peer.incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else if host_outgoing_bandwidth == 0 || peer.incoming_bandwidth == 0 {
            scaled_window_size(host_outgoing_bandwidth.max(peer.incoming_bandwidth))
        } else {
            scaled_window_size(host_outgoing_bandwidth.min(peer.incoming_bandwidth))
        };

        let mut window_size = if host_incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            scaled_window_size(host_incoming_bandwidth)
        };
        if window_size > connect.window_size {
            window_size = connect.window_size;
        }
        window_size = window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        let verify = Command::new(
            COMMAND_VERIFY_CONNECT | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::VerifyConnect(VerifyConnectCommand {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id,
                outgoing_session_id,
                mtu: peer.mtu,
                window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: host_incoming_bandwidth,
                outgoing_bandwidth: host_outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id: peer.connect_id,
            }),
        );

        self.peers[index].queue_outgoing_command(&mut self.shared, verify, None, 0, 0);

        Some(index)
    }

    fn handle_verify_connect(
        &mut self,
        index: usize,
        command: &Command,
        event: &mut Option<Event>,
        deliver: bool,
    ) -> Result<(), ()> {
        if self.peers[index].state != PeerState::Connecting {
            return Ok(());
        }

        let CommandBody::VerifyConnect(verify) = command.body else {
            return Err(());
        };

        let channel_count = verify.channel_count as usize;

        let mismatched = {
            let peer = &self.peers[index];
            channel_count < MINIMUM_CHANNEL_COUNT
                || channel_count > MAXIMUM_CHANNEL_COUNT
                || verify.packet_throttle_interval != peer.packet_throttle_interval
                || verify.packet_throttle_acceleration != peer.packet_throttle_acceleration
                || verify.packet_throttle_deceleration != peer.packet_throttle_deceleration
                || verify.connect_id != peer.connect_id
        };

        if mismatched {
            self.peers[index].event_data = 0;
            self.peers[index].dispatch_state(&mut self.shared, PeerState::Zombie);
            return Err(());
        }

        let peer = &mut self.peers[index];

        peer.remove_sent_reliable_command(1, 0xFF);

        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }

        peer.outgoing_peer_id = verify.outgoing_peer_id;
        peer.incoming_session_id = verify.incoming_session_id;
        peer.outgoing_session_id = verify.outgoing_session_id;

        let mtu = verify.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        let window_size = verify
            .window_size
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);
        if window_size < peer.window_size {
            peer.window_size = window_size;
        }

        peer.incoming_bandwidth = verify.incoming_bandwidth;
        peer.outgoing_bandwidth = verify.outgoing_bandwidth;

        self.notify_connect(index, event, deliver);
        Ok(())
    }

    fn handle_disconnect(&mut self, index: usize, command: &Command) -> Result<(), ()> {
        let CommandBody::Disconnect { data } = command.body else {
            return Err(());
        };

        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return Ok(());
        }

        self.peers[index].reset_queues(&mut self.shared);

        if matches!(
            state,
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting
        ) {
            self.peers[index].dispatch_state(&mut self.shared, PeerState::Zombie);
        } else if state != PeerState::Connected && state != PeerState::DisconnectLater {
            if state == PeerState::ConnectionPending {
                self.shared.recalculate_bandwidth_limits = true;
            }
            self.peers[index].reset(&mut self.shared);
        } else if command.header.command & COMMAND_FLAG_ACKNOWLEDGE != 0 {
            self.peers[index].change_state(&mut self.shared, PeerState::AcknowledgingDisconnect);
        } else {
            self.peers[index].dispatch_state(&mut self.shared, PeerState::Zombie);
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }

        Ok(())
    }

    fn handle_ping(&mut self, index: usize) -> Result<(), ()> {
        if self.peers[index].is_connected() {
            Ok(())
        } else {
            Err(())
        }
    }

    fn handle_bandwidth_limit(&mut self, index: usize, command: &Command) -> Result<(), ()> {
        let CommandBody::BandwidthLimit {
            incoming_bandwidth,
            outgoing_bandwidth,
        } = command.body
        else {
            return Err(());
        };

        if !self.peers[index].is_connected() {
            return Err(());
        }

        let host_outgoing_bandwidth = self.shared.outgoing_bandwidth;
        let peer = &mut self.peers[index];

        if peer.incoming_bandwidth != 0 {
            self.shared.bandwidth_limited_peers -= 1;
        }
        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;
        if peer.incoming_bandwidth != 0 {
            self.shared.bandwidth_limited_peers += 1;
        }

        peer.window_size = if peer.incoming_bandwidth == 0 && host_outgoing_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else if peer.incoming_bandwidth == 0 || host_outgoing_bandwidth == 0 {
            scaled_window_size(peer.incoming_bandwidth.max(host_outgoing_bandwidth))
        } else {
            scaled_window_size(peer.incoming_bandwidth.min(host_outgoing_bandwidth))
        };

        Ok(())
    }

    fn handle_throttle_configure(&mut self, index: usize, command: &Command) -> Result<(), ()> {
        let CommandBody::ThrottleConfigure {
            interval,
            acceleration,
            deceleration,
        } = command.body
        else {
            return Err(());
        };

        if !self.peers[index].is_connected() {
            return Err(());
        }

        let peer = &mut self.peers[index];
        peer.packet_throttle_interval = interval;
        peer.packet_throttle_acceleration = acceleration;
        peer.packet_throttle_deceleration = deceleration;

        Ok(())
    }

    fn check_send_state(&self, index: usize, command: &Command) -> Result<(), ()> {
        let peer = &self.peers[index];
        if usize::from(command.header.channel_id) >= peer.channels.len()
            || !peer.is_connected()
        {
            Err(())
        } else {
            Ok(())
        }
    }

    fn handle_send_reliable(
        &mut self,
        index: usize,
        command: &Command,
        payload: &[u8],
    ) -> Result<(), ()> {
        self.check_send_state(index, command)?;

        self.peers[index]
            .queue_incoming_command(
                &mut self.shared,
                command,
                Some(payload),
                payload.len(),
                Packet::RELIABLE,
                0,
            )
            .map(|_| ())
    }

    fn handle_send_unreliable(
        &mut self,
        index: usize,
        command: &Command,
        payload: &[u8],
    ) -> Result<(), ()> {
        self.check_send_state(index, command)?;

        self.peers[index]
            .queue_incoming_command(&mut self.shared, command, Some(payload), payload.len(), 0, 0)
            .map(|_| ())
    }

    fn handle_send_unsequenced(
        &mut self,
        index: usize,
        command: &Command,
        payload: &[u8],
    ) -> Result<(), ()> {
        self.check_send_state(index, command)?;

        let CommandBody::SendUnsequenced {
            unsequenced_group, ..
        } = command.body
        else {
            return Err(());
        };

        let peer = &mut self.peers[index];

        let mut group = u32::from(unsequenced_group);
        let window_index = (group % u32::from(peer::UNSEQUENCED_WINDOW_SIZE)) as usize;

        if group < u32::from(peer.incoming_unsequenced_group) {
            group += 0x10000;
        }

        if group
            >= u32::from(peer.incoming_unsequenced_group)
                + u32::from(peer::FREE_UNSEQUENCED_WINDOWS)
                    * u32::from(peer::UNSEQUENCED_WINDOW_SIZE)
        {
            return Ok(());
        }

        let group = (group & 0xFFFF) as u16;

        if group.wrapping_sub(window_index as u16) != peer.incoming_unsequenced_group {
            peer.incoming_unsequenced_group = group.wrapping_sub(window_index as u16);
            peer.unsequenced_window = [0; peer::UNSEQUENCED_WINDOW_SIZE as usize / 32];
        } else if peer.unsequenced_window[window_index / 32] & (1 << (window_index % 32)) != 0 {
            return Ok(());
        }

        self.peers[index].queue_incoming_command(
            &mut self.shared,
            command,
            Some(payload),
            payload.len(),
            Packet::UNSEQUENCED,
            0,
        )?;

        self.peers[index].unsequenced_window[window_index / 32] |= 1 << (window_index % 32);

        Ok(())
    }

    fn handle_send_fragment(
        &mut self,
        index: usize,
        command: &Command,
        payload: &[u8],
    ) -> Result<(), ()> {
        self.check_send_state(index, command)?;

        let CommandBody::SendFragment(fragment) = command.body else {
            return Err(());
        };

        if payload.is_empty() {
            return Err(());
        }

        let channel_index = usize::from(command.header.channel_id);
        let start_sequence_number = fragment.start_sequence_number;

        {
            let channel = &self.peers[index].channels[channel_index];
            if !channel.accepts_incoming(start_sequence_number) {
                return Ok(());
            }
        }

        let fragment_number = fragment.fragment_number;
        let fragment_count = fragment.fragment_count;
        let fragment_offset = fragment.fragment_offset;
        let total_length = fragment.total_length;

        if fragment_count > MAXIMUM_FRAGMENT_COUNT
            || fragment_number >= fragment_count
            || total_length as usize > self.shared.maximum_packet_size
            || total_length < fragment_count
            || fragment_offset >= total_length
            || payload.len() as u32 > total_length - fragment_offset
        {
            return Err(());
        }

        let start_index = {
            let peer = &self.peers[index];
            let channel = &peer.channels[channel_index];
            let arena = &peer.incoming_arena;
            let current = channel.incoming_reliable_sequence_number;

            let mut found = None;
            let mut cursor = channel.incoming_reliable_commands.back();
            while let Some(item) = cursor {
                let incoming = &arena[item];

                if start_sequence_number >= current {
                    if incoming.reliable_sequence_number < current {
                        cursor = arena.prev_of(item);
                        continue;
                    }
                } else if incoming.reliable_sequence_number >= current {
                    break;
                }

                if incoming.reliable_sequence_number <= start_sequence_number {
                    if incoming.reliable_sequence_number < start_sequence_number {
                        break;
                    }

                    if incoming.command.kind() != COMMAND_SEND_FRAGMENT
                        || total_length as usize != incoming.packet.len()
                        || fragment_count != incoming.fragment_count
                    {
                        return Err(());
                    }

                    found = Some(item);
                    break;
                }

                cursor = arena.prev_of(item);
            }
            found
        };

        let start_index = match start_index {
            Some(start_index) => start_index,
            None => {
                let mut host_command = *command;
                host_command.header.reliable_sequence_number = start_sequence_number;

                match self.peers[index].queue_incoming_command(
                    &mut self.shared,
                    &host_command,
                    None,
                    total_length as usize,
                    Packet::RELIABLE,
                    fragment_count,
                )? {
                    Inserted::Accepted(start_index) => start_index,
                    Inserted::Discarded => return Err(()),
                }
            }
        };

        self.store_fragment(
            index,
            channel_index,
            start_index,
            fragment_number,
            fragment_offset,
            payload,
            true,
        );

        Ok(())
    }

    fn handle_send_unreliable_fragment(
        &mut self,
        index: usize,
        command: &Command,
        payload: &[u8],
    ) -> Result<(), ()> {
        self.check_send_state(index, command)?;

        let CommandBody::SendFragment(fragment) = command.body else {
            return Err(());
        };

        let channel_index = usize::from(command.header.channel_id);
        let reliable_sequence_number = command.header.reliable_sequence_number;
        let start_sequence_number = fragment.start_sequence_number;

        {
            let channel = &self.peers[index].channels[channel_index];
            if !channel.accepts_incoming(reliable_sequence_number) {
                return Ok(());
            }

            if reliable_sequence_number == channel.incoming_reliable_sequence_number
                && start_sequence_number <= channel.incoming_unreliable_sequence_number
            {
                return Ok(());
            }
        }

        let fragment_number = fragment.fragment_number;
        let fragment_count = fragment.fragment_count;
        let fragment_offset = fragment.fragment_offset;
        let total_length = fragment.total_length;

        if fragment_count > MAXIMUM_FRAGMENT_COUNT
            || fragment_number >= fragment_count
            || total_length as usize > self.shared.maximum_packet_size
            || fragment_offset >= total_length
            || payload.len() as u32 > total_length - fragment_offset
        {
            return Err(());
        }

        let start_index = {
            let peer = &self.peers[index];
            let channel = &peer.channels[channel_index];
            let arena = &peer.incoming_arena;
            let current = channel.incoming_reliable_sequence_number;

            let mut found = None;
            let mut cursor = channel.incoming_unreliable_commands.back();
            while let Some(item) = cursor {
                let incoming = &arena[item];

                if reliable_sequence_number >= current {
                    if incoming.reliable_sequence_number < current {
                        cursor = arena.prev_of(item);
                        continue;
                    }
                } else if incoming.reliable_sequence_number >= current {
                    break;
                }

                if incoming.reliable_sequence_number < reliable_sequence_number {
                    break;
                }
                if incoming.reliable_sequence_number > reliable_sequence_number {
                    cursor = arena.prev_of(item);
                    continue;
                }

                if incoming.unreliable_sequence_number <= start_sequence_number {
                    if incoming.unreliable_sequence_number < start_sequence_number {
                        break;
                    }

                    if incoming.command.kind() != COMMAND_SEND_UNRELIABLE_FRAGMENT
                        || total_length as usize != incoming.packet.len()
                        || fragment_count != incoming.fragment_count
                    {
                        return Err(());
                    }

                    found = Some(item);
                    break;
                }

                cursor = arena.prev_of(item);
            }
            found
        };

        let start_index = match start_index {
            Some(start_index) => start_index,
            None => {
                match self.peers[index].queue_incoming_command(
                    &mut self.shared,
                    command,
                    None,
                    total_length as usize,
                    Packet::UNRELIABLE_FRAGMENT,
                    fragment_count,
                )? {
                    Inserted::Accepted(start_index) => start_index,
                    Inserted::Discarded => return Err(()),
                }
            }
        };

        self.store_fragment(
            index,
            channel_index,
            start_index,
            fragment_number,
            fragment_offset,
            payload,
            false,
        );

        Ok(())
    }

    fn store_fragment(
        &mut self,
        index: usize,
        channel_index: usize,
        start_index: usize,
        fragment_number: u32,
        fragment_offset: u32,
        payload: &[u8],
        reliable: bool,
    ) {
        let completed = {
            let incoming = &mut self.peers[index].incoming_arena[start_index];
            let word = (fragment_number / 32) as usize;
            let bit = 1u32 << (fragment_number % 32);

            if incoming.fragments[word] & bit != 0 {
                return;
            }

            incoming.fragments_remaining -= 1;
            incoming.fragments[word] |= bit;

            // Oversized trailing fragments are truncated to fit, for
            // compatibility with senders that round up.
            let mut length = payload.len();
            if fragment_offset as usize + length > incoming.packet.len() {
                length = incoming.packet.len() - fragment_offset as usize;
            }
            incoming
                .packet
                .write_at(fragment_offset as usize, &payload[..length]);

            incoming.fragments_remaining == 0
        };

        if completed {
            if reliable {
                self.peers[index].dispatch_incoming_reliable_commands(
                    &mut self.shared,
                    channel_index,
                    None,
                );
            } else {
                self.peers[index].dispatch_incoming_unreliable_commands(
                    &mut self.shared,
                    channel_index,
                    None,
                );
            }
        }
    }

    // ---- bandwidth throttle ----

    /// Redistribute per-peer throttle limits against the configured caps,
    /// and renegotiate advertised bandwidth limits when flagged.
    fn bandwidth_throttle(&mut self) {
        let time_current = self.shared.time_now();
        let elapsed_time = time_current.wrapping_sub(self.shared.bandwidth_throttle_epoch);

        if elapsed_time < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }

        self.shared.bandwidth_throttle_epoch = time_current;

        let mut peers_remaining = self.shared.connected_peers as u32;
        if peers_remaining == 0 {
            return;
        }

        let mut data_total = u32::MAX;
        let mut bandwidth = u32::MAX;
        let mut needs_adjustment = self.shared.bandwidth_limited_peers > 0;

        if self.shared.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = ((u64::from(self.shared.outgoing_bandwidth) * u64::from(elapsed_time))
                / 1000) as u32;

            for peer in &self.peers {
                if !peer.is_connected() {
                    continue;
                }
                data_total = data_total.wrapping_add(peer.outgoing_data_total);
            }
        }

        let mut throttle;

        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;

            throttle = if data_total <= bandwidth {
                peer::PACKET_THROTTLE_SCALE
            } else {
                ((u64::from(bandwidth) * u64::from(peer::PACKET_THROTTLE_SCALE))
                    / u64::from(data_total)) as u32
            };

            for peer in &mut self.peers {
                if !peer.is_connected()
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                let peer_bandwidth = ((u64::from(peer.incoming_bandwidth)
                    * u64::from(elapsed_time))
                    / 1000) as u32;
                if (u64::from(throttle) * u64::from(peer.outgoing_data_total))
                    / u64::from(peer::PACKET_THROTTLE_SCALE)
                    <= u64::from(peer_bandwidth)
                {
                    continue;
                }

                peer.packet_throttle_limit = (((u64::from(peer_bandwidth)
                    * u64::from(peer::PACKET_THROTTLE_SCALE))
                    / u64::from(peer.outgoing_data_total))
                    as u32)
                    .max(1);

                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }

                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.wrapping_sub(peer_bandwidth);
                data_total = data_total.wrapping_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                peer::PACKET_THROTTLE_SCALE
            } else {
                ((u64::from(bandwidth) * u64::from(peer::PACKET_THROTTLE_SCALE))
                    / u64::from(data_total)) as u32
            };

            for peer in &mut self.peers {
                if !peer.is_connected() || peer.outgoing_bandwidth_throttle_epoch == time_current {
                    continue;
                }

                peer.packet_throttle_limit = throttle;
                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }

                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.shared.recalculate_bandwidth_limits {
            self.shared.recalculate_bandwidth_limits = false;

            let mut peers_remaining = self.shared.connected_peers as u32;
            let mut bandwidth = self.shared.incoming_bandwidth;
            let mut needs_adjustment = true;
            let mut bandwidth_limit = 0;

            if bandwidth != 0 {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;

                    for peer in &mut self.peers {
                        if !peer.is_connected()
                            || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }
                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }

                        peer.incoming_bandwidth_throttle_epoch = time_current;

                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.wrapping_sub(peer.outgoing_bandwidth);
                    }
                }
            }

            let outgoing_bandwidth = self.shared.outgoing_bandwidth;
            for index in 0..self.peers.len() {
                if !self.peers[index].is_connected() {
                    continue;
                }

                let incoming_bandwidth =
                    if self.peers[index].incoming_bandwidth_throttle_epoch == time_current {
                        self.peers[index].outgoing_bandwidth
                    } else {
                        bandwidth_limit
                    };

                let command = Command::new(
                    COMMAND_BANDWIDTH_LIMIT | COMMAND_FLAG_ACKNOWLEDGE,
                    0xFF,
                    CommandBody::BandwidthLimit {
                        incoming_bandwidth,
                        outgoing_bandwidth,
                    },
                );
                self.peers[index].queue_outgoing_command(&mut self.shared, command, None, 0, 0);
            }
        }
    }
}

fn clamp_channel_limit(channel_limit: usize) -> usize {
    if channel_limit == 0 || channel_limit > MAXIMUM_CHANNEL_COUNT {
        MAXIMUM_CHANNEL_COUNT
    } else {
        channel_limit.max(MINIMUM_CHANNEL_COUNT)
    }
}

fn initial_window_size(bandwidth: u32) -> u32 {
    if bandwidth == 0 {
        MAXIMUM_WINDOW_SIZE
    } else {
        scaled_window_size(bandwidth)
    }
}

fn scaled_window_size(bandwidth: u32) -> u32 {
    ((bandwidth / peer::WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE)
        .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

/// Bit mask of the windows that must stay clear before a command may open
/// the window `reliable_window`, wrapping around the window ring.
fn window_wrap_mask(reliable_window: u16) -> u32 {
    let span = (1u32 << (FREE_RELIABLE_WINDOWS + 2)) - 1;
    (span << reliable_window) | (span >> (RELIABLE_WINDOWS - reliable_window))
}

fn is_broadcast(address: &SocketAddr) -> bool {
    match address.ip() {
        IpAddr::V4(ip) => ip.is_broadcast(),
        IpAddr::V6(_) => false,
    }
}

fn payload_length(command: &Command) -> Option<usize> {
    match command.body {
        CommandBody::SendReliable { data_length } => Some(usize::from(data_length)),
        CommandBody::SendUnreliable { data_length, .. } => Some(usize::from(data_length)),
        CommandBody::SendUnsequenced { data_length, .. } => Some(usize::from(data_length)),
        CommandBody::SendFragment(FragmentCommand { data_length, .. }) => {
            Some(usize::from(data_length))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_wrap_mask_covers_the_neighborhood() {
        // Window 0 guards the span starting at itself plus the wrapped tail.
        assert_eq!(window_wrap_mask(0), 0x3FF);
        // The wrapped component reappears for high windows.
        assert_ne!(window_wrap_mask(15) & 0xFF, 0);
    }

    #[test]
    fn channel_limit_is_clamped() {
        assert_eq!(clamp_channel_limit(0), MAXIMUM_CHANNEL_COUNT);
        assert_eq!(clamp_channel_limit(300), MAXIMUM_CHANNEL_COUNT);
        assert_eq!(clamp_channel_limit(2), 2);
    }

    #[test]
    fn window_size_scales_with_bandwidth() {
        assert_eq!(initial_window_size(0), MAXIMUM_WINDOW_SIZE);
        assert_eq!(scaled_window_size(1), MINIMUM_WINDOW_SIZE);
        assert_eq!(scaled_window_size(64 * 1024 * 4), 4 * MINIMUM_WINDOW_SIZE);
        assert_eq!(scaled_window_size(u32::MAX), MAXIMUM_WINDOW_SIZE);
    }
}
