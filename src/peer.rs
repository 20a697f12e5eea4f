//! Per-session protocol engine.
//!
//! A `Peer` is one slot of a host: the remote address, per-channel
//! sequencing state, the four command queues, and the estimators driving
//! retransmission and throttling. All of it is plain state; the host's
//! service loop calls in here with the shared host state threaded through
//! explicitly.

use log::trace;
use smallvec::SmallVec;

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::channel::{Channel, FREE_RELIABLE_WINDOWS, RELIABLE_WINDOW_SIZE};
use crate::host::Shared;
use crate::packet::Packet;
use crate::protocol::{
    command_size, Command, CommandBody, CommandHeader, COMMAND_FLAG_ACKNOWLEDGE,
    COMMAND_FLAG_UNSEQUENCED, COMMAND_NONE, COMMAND_PING, COMMAND_SEND_FRAGMENT,
    COMMAND_SEND_RELIABLE, COMMAND_SEND_UNRELIABLE, COMMAND_SEND_UNRELIABLE_FRAGMENT,
    COMMAND_SEND_UNSEQUENCED, COMMAND_THROTTLE_CONFIGURE, MAXIMUM_FRAGMENT_COUNT,
    MAXIMUM_PEER_ID, MAXIMUM_WINDOW_SIZE,
};
use crate::queue::{Arena, Queue};

pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
pub const DEFAULT_PACKET_THROTTLE: u32 = 32;
pub const PACKET_THROTTLE_SCALE: u32 = 32;
pub const PACKET_THROTTLE_COUNTER: u32 = 7;
pub const PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub const PACKET_THROTTLE_DECELERATION: u32 = 2;
pub const PACKET_THROTTLE_INTERVAL: u32 = 5000;
pub const PACKET_LOSS_SCALE: u32 = 1 << 16;
pub const PACKET_LOSS_INTERVAL: u32 = 10_000;
pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;
pub const TIMEOUT_LIMIT: u32 = 32;
pub const TIMEOUT_MINIMUM: u32 = 5000;
pub const TIMEOUT_MAXIMUM: u32 = 30_000;
pub const PING_INTERVAL: u32 = 500;
pub const UNSEQUENCED_WINDOW_SIZE: u16 = 1024;
pub const FREE_UNSEQUENCED_WINDOWS: u16 = 32;

pub(crate) const FLAG_NEEDS_DISPATCH: u16 = 1 << 0;
pub(crate) const FLAG_CONTINUE_SENDING: u16 = 1 << 1;

/// Session lifecycle of one peer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    AcknowledgingConnect,
    ConnectionPending,
    ConnectionSucceeded,
    Connected,
    DisconnectLater,
    Disconnecting,
    AcknowledgingDisconnect,
    Zombie,
}

#[derive(Debug)]
pub(crate) struct OutgoingCommand {
    pub command: Command,
    pub packet: Option<Packet>,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub sent_time: u32,
    pub round_trip_timeout: u32,
    pub queue_time: u32,
    pub send_attempts: u16,
}

#[derive(Debug)]
pub(crate) struct IncomingCommand {
    pub command: Command,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub fragment_count: u32,
    pub fragments_remaining: u32,
    pub fragments: SmallVec<[u32; 4]>,
    pub packet: Packet,
}

#[derive(Debug)]
pub(crate) struct Acknowledgement {
    pub sent_time: u32,
    pub command: CommandHeader,
}

/// Whether an incoming command made it onto a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inserted {
    Accepted(usize),
    Discarded,
}

pub struct Peer {
    pub(crate) incoming_peer_id: u16,
    pub(crate) outgoing_peer_id: u16,
    pub(crate) connect_id: u32,
    pub(crate) outgoing_session_id: u8,
    pub(crate) incoming_session_id: u8,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) incoming_bandwidth_throttle_epoch: u32,
    pub(crate) outgoing_bandwidth_throttle_epoch: u32,
    pub(crate) incoming_data_total: u32,
    pub(crate) outgoing_data_total: u32,
    pub(crate) last_send_time: u32,
    pub(crate) last_receive_time: u32,
    pub(crate) next_timeout: u32,
    pub(crate) earliest_timeout: u32,
    pub(crate) packet_loss_epoch: u32,
    pub(crate) packets_sent: u32,
    pub(crate) packets_lost: u32,
    pub(crate) packet_loss: u32,
    pub(crate) packet_loss_variance: u32,
    pub(crate) packet_throttle: u32,
    pub(crate) packet_throttle_limit: u32,
    pub(crate) packet_throttle_counter: u32,
    pub(crate) packet_throttle_epoch: u32,
    pub(crate) packet_throttle_acceleration: u32,
    pub(crate) packet_throttle_deceleration: u32,
    pub(crate) packet_throttle_interval: u32,
    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,
    pub(crate) last_round_trip_time: u32,
    pub(crate) lowest_round_trip_time: u32,
    pub(crate) last_round_trip_time_variance: u32,
    pub(crate) highest_round_trip_time_variance: u32,
    pub(crate) round_trip_time: u32,
    pub(crate) round_trip_time_variance: u32,
    pub(crate) mtu: u32,
    pub(crate) window_size: u32,
    pub(crate) reliable_data_in_transit: u32,
    pub(crate) outgoing_reliable_sequence_number: u16,

    pub(crate) outgoing_arena: Arena<OutgoingCommand>,
    pub(crate) acknowledgements: VecDeque<Acknowledgement>,
    pub(crate) sent_reliable_commands: Queue,
    pub(crate) sent_unreliable_commands: Queue,
    pub(crate) outgoing_commands: Queue,
    pub(crate) outgoing_send_reliable_commands: Queue,

    pub(crate) incoming_arena: Arena<IncomingCommand>,
    pub(crate) dispatched_commands: Queue,

    pub(crate) flags: u16,
    pub(crate) incoming_unsequenced_group: u16,
    pub(crate) outgoing_unsequenced_group: u16,
    pub(crate) unsequenced_window: [u32; UNSEQUENCED_WINDOW_SIZE as usize / 32],
    pub(crate) event_data: u32,
    pub(crate) total_waiting_data: usize,
}

impl Peer {
    pub(crate) fn new(incoming_peer_id: u16, mtu: u32) -> Peer {
        let mut peer = Peer {
            incoming_peer_id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            connect_id: 0,
            outgoing_session_id: 0xFF,
            incoming_session_id: 0xFF,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            packet_throttle: DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: PACKET_THROTTLE_DECELERATION,
            packet_throttle_interval: PACKET_THROTTLE_INTERVAL,
            ping_interval: PING_INTERVAL,
            timeout_limit: TIMEOUT_LIMIT,
            timeout_minimum: TIMEOUT_MINIMUM,
            timeout_maximum: TIMEOUT_MAXIMUM,
            last_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            lowest_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            outgoing_arena: Arena::new(),
            acknowledgements: VecDeque::new(),
            sent_reliable_commands: Queue::new(),
            sent_unreliable_commands: Queue::new(),
            outgoing_commands: Queue::new(),
            outgoing_send_reliable_commands: Queue::new(),
            incoming_arena: Arena::new(),
            dispatched_commands: Queue::new(),
            flags: 0,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; UNSEQUENCED_WINDOW_SIZE as usize / 32],
            event_data: 0,
            total_waiting_data: 0,
        };
        // Session ids survive resets so stale datagrams from a previous
        // session never match a new one; only construction seeds them.
        peer.reset_statistics(mtu);
        peer
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    /// Mean round trip time of reliable traffic, in milliseconds.
    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    /// Mean loss of reliable packets as a ratio to `PACKET_LOSS_SCALE`.
    pub fn packet_loss(&self) -> u32 {
        self.packet_loss
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == PeerState::Connected || self.state == PeerState::DisconnectLater
    }

    pub(crate) fn on_connect(&mut self, shared: &mut Shared) {
        if !self.is_connected() {
            if self.incoming_bandwidth != 0 {
                shared.bandwidth_limited_peers += 1;
            }
            shared.connected_peers += 1;
        }
    }

    pub(crate) fn on_disconnect(&mut self, shared: &mut Shared) {
        if self.is_connected() {
            if self.incoming_bandwidth != 0 {
                shared.bandwidth_limited_peers -= 1;
            }
            shared.connected_peers -= 1;
        }
    }

    pub(crate) fn change_state(&mut self, shared: &mut Shared, state: PeerState) {
        if state == PeerState::Connected || state == PeerState::DisconnectLater {
            self.on_connect(shared);
        } else {
            self.on_disconnect(shared);
        }
        self.state = state;
    }

    /// Change state and queue the peer for event emission.
    pub(crate) fn dispatch_state(&mut self, shared: &mut Shared, state: PeerState) {
        self.change_state(shared, state);
        self.mark_needs_dispatch(shared);
    }

    pub(crate) fn mark_needs_dispatch(&mut self, shared: &mut Shared) {
        if self.flags & FLAG_NEEDS_DISPATCH == 0 {
            shared.dispatch_queue.push_back(self.incoming_peer_id as usize);
            self.flags |= FLAG_NEEDS_DISPATCH;
        }
    }

    pub(crate) fn reset_queues(&mut self, shared: &mut Shared) {
        if self.flags & FLAG_NEEDS_DISPATCH != 0 {
            let id = self.incoming_peer_id as usize;
            shared.dispatch_queue.retain(|&peer| peer != id);
            self.flags &= !FLAG_NEEDS_DISPATCH;
        }

        self.acknowledgements.clear();

        reset_outgoing_queue(&mut self.outgoing_arena, &mut self.sent_reliable_commands);
        reset_outgoing_queue(&mut self.outgoing_arena, &mut self.sent_unreliable_commands);
        reset_outgoing_queue(&mut self.outgoing_arena, &mut self.outgoing_commands);
        reset_outgoing_queue(
            &mut self.outgoing_arena,
            &mut self.outgoing_send_reliable_commands,
        );
        reset_incoming_queue(&mut self.incoming_arena, &mut self.dispatched_commands);

        for channel in &mut self.channels {
            reset_incoming_queue(&mut self.incoming_arena, &mut channel.incoming_reliable_commands);
            reset_incoming_queue(
                &mut self.incoming_arena,
                &mut channel.incoming_unreliable_commands,
            );
        }

        self.channels.clear();
        self.outgoing_arena.clear();
        self.incoming_arena.clear();
    }

    fn reset_statistics(&mut self, host_mtu: u32) {
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.state = PeerState::Disconnected;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.packet_throttle = DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.packet_throttle_acceleration = PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PACKET_THROTTLE_DECELERATION;
        self.packet_throttle_interval = PACKET_THROTTLE_INTERVAL;
        self.ping_interval = PING_INTERVAL;
        self.timeout_limit = TIMEOUT_LIMIT;
        self.timeout_minimum = TIMEOUT_MINIMUM;
        self.timeout_maximum = TIMEOUT_MAXIMUM;
        self.last_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.mtu = host_mtu;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.flags = 0;
        self.unsequenced_window = [0; UNSEQUENCED_WINDOW_SIZE as usize / 32];
    }

    /// Tear the slot down to `Disconnected` with no notification.
    pub(crate) fn reset(&mut self, shared: &mut Shared) {
        self.on_disconnect(shared);
        // Queues first: their teardown removes the slot from the dispatch
        // queue while the dispatch flag is still readable.
        self.reset_queues(shared);
        let host_mtu = shared.mtu;
        self.reset_statistics(host_mtu);
    }

    /// Adjust the unreliable-drop probability from a fresh RTT sample.
    pub(crate) fn throttle(&mut self, rtt: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt <= self.last_round_trip_time {
            self.packet_throttle += self.packet_throttle_acceleration;
            if self.packet_throttle > self.packet_throttle_limit {
                self.packet_throttle = self.packet_throttle_limit;
            }
            return 1;
        } else if rtt > self.last_round_trip_time + 2 * self.last_round_trip_time_variance {
            if self.packet_throttle > self.packet_throttle_deceleration {
                self.packet_throttle -= self.packet_throttle_deceleration;
            } else {
                self.packet_throttle = 0;
            }
            return -1;
        }
        0
    }

    pub(crate) fn throttle_configure(
        &mut self,
        shared: &mut Shared,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) {
        self.packet_throttle_interval = interval;
        self.packet_throttle_acceleration = acceleration;
        self.packet_throttle_deceleration = deceleration;

        let command = Command::new(
            COMMAND_THROTTLE_CONFIGURE | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::ThrottleConfigure {
                interval,
                acceleration,
                deceleration,
            },
        );
        self.queue_outgoing_command(shared, command, None, 0, 0);
    }

    /// Queue `packet` for sending on `channel_id`, fragmenting payloads
    /// that exceed the session MTU.
    pub(crate) fn send(
        &mut self,
        shared: &mut Shared,
        channel_id: u8,
        packet: Packet,
    ) -> Result<(), ()> {
        if self.state != PeerState::Connected
            || usize::from(channel_id) >= self.channels.len()
            || packet.len() > shared.maximum_packet_size
        {
            return Err(());
        }

        let mut fragment_length =
            self.mtu as usize - 4 - command_size(COMMAND_SEND_FRAGMENT);
        if shared.checksum.is_some() {
            fragment_length -= 4;
        }

        let data_length = packet.len();
        if data_length > fragment_length {
            let fragment_count = (data_length + fragment_length - 1) / fragment_length;
            if fragment_count as u32 > MAXIMUM_FRAGMENT_COUNT {
                return Err(());
            }

            let channel = &self.channels[usize::from(channel_id)];
            let flags = packet.flags();
            let (command_number, start_sequence_number) = if flags
                & (Packet::RELIABLE | Packet::UNRELIABLE_FRAGMENT)
                == Packet::UNRELIABLE_FRAGMENT
                && channel.outgoing_unreliable_sequence_number < 0xFFFF
            {
                (
                    COMMAND_SEND_UNRELIABLE_FRAGMENT,
                    channel.outgoing_unreliable_sequence_number.wrapping_add(1),
                )
            } else {
                (
                    COMMAND_SEND_FRAGMENT | COMMAND_FLAG_ACKNOWLEDGE,
                    channel.outgoing_reliable_sequence_number.wrapping_add(1),
                )
            };

            let mut fragment_offset = 0usize;
            let mut fragment_number = 0u32;
            while fragment_offset < data_length {
                let length = fragment_length.min(data_length - fragment_offset);

                let command = Command::new(
                    command_number,
                    channel_id,
                    CommandBody::SendFragment(crate::protocol::FragmentCommand {
                        start_sequence_number,
                        data_length: length as u16,
                        fragment_count: fragment_count as u32,
                        fragment_number,
                        total_length: data_length as u32,
                        fragment_offset: fragment_offset as u32,
                    }),
                );

                self.queue_outgoing_command(
                    shared,
                    command,
                    Some(packet.clone()),
                    fragment_offset as u32,
                    length as u16,
                );

                fragment_offset += length;
                fragment_number += 1;
            }

            return Ok(());
        }

        let flags = packet.flags();
        let channel = &self.channels[usize::from(channel_id)];
        let command = if flags & (Packet::RELIABLE | Packet::UNSEQUENCED) == Packet::UNSEQUENCED {
            Command::new(
                COMMAND_SEND_UNSEQUENCED | COMMAND_FLAG_UNSEQUENCED,
                channel_id,
                CommandBody::SendUnsequenced {
                    unsequenced_group: 0,
                    data_length: data_length as u16,
                },
            )
        } else if flags & Packet::RELIABLE != 0
            || channel.outgoing_unreliable_sequence_number >= 0xFFFF
        {
            Command::new(
                COMMAND_SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE,
                channel_id,
                CommandBody::SendReliable {
                    data_length: data_length as u16,
                },
            )
        } else {
            Command::new(
                COMMAND_SEND_UNRELIABLE,
                channel_id,
                CommandBody::SendUnreliable {
                    unreliable_sequence_number: 0,
                    data_length: data_length as u16,
                },
            )
        };

        self.queue_outgoing_command(shared, command, Some(packet), 0, data_length as u16);
        Ok(())
    }

    /// Dequeue one delivered payload, if any.
    pub(crate) fn receive(&mut self) -> Option<(u8, Packet)> {
        let incoming = self
            .dispatched_commands
            .pop_front(&mut self.incoming_arena)?;

        let channel_id = incoming.command.header.channel_id;
        let packet = incoming.packet;
        Packet::release(packet.clone());

        self.total_waiting_data -= packet.len().min(self.total_waiting_data);

        Some((channel_id, packet))
    }

    pub(crate) fn ping(&mut self, shared: &mut Shared) {
        if self.state != PeerState::Connected {
            return;
        }

        let command = Command::new(
            COMMAND_PING | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Ping,
        );
        self.queue_outgoing_command(shared, command, None, 0, 0);
    }

    pub(crate) fn set_ping_interval(&mut self, interval: u32) {
        self.ping_interval = if interval != 0 { interval } else { PING_INTERVAL };
    }

    pub(crate) fn set_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        self.timeout_limit = if limit != 0 { limit } else { TIMEOUT_LIMIT };
        self.timeout_minimum = if minimum != 0 { minimum } else { TIMEOUT_MINIMUM };
        self.timeout_maximum = if maximum != 0 { maximum } else { TIMEOUT_MAXIMUM };
    }

    pub(crate) fn has_outgoing_commands(&self) -> bool {
        !self.outgoing_commands.is_empty()
            || !self.outgoing_send_reliable_commands.is_empty()
            || !self.sent_reliable_commands.is_empty()
    }

    /// Queue an acknowledgement for a received reliable command, unless its
    /// sequence number sits in the tail windows reserved against wrap.
    pub(crate) fn queue_acknowledgement(&mut self, command: &CommandHeader, sent_time: u16) {
        if usize::from(command.channel_id) < self.channels.len() {
            let channel = &self.channels[usize::from(command.channel_id)];
            let reliable_window = channel.incoming_window_of(command.reliable_sequence_number);
            let current_window = channel.current_incoming_window();

            if reliable_window >= current_window + FREE_RELIABLE_WINDOWS - 1
                && reliable_window <= current_window + FREE_RELIABLE_WINDOWS
            {
                return;
            }
        }

        self.outgoing_data_total = self
            .outgoing_data_total
            .wrapping_add(command_size(crate::protocol::COMMAND_ACKNOWLEDGE) as u32);

        self.acknowledgements.push_back(Acknowledgement {
            sent_time: u32::from(sent_time),
            command: *command,
        });
    }

    /// Assign sequence numbers and file the command onto the right queue.
    pub(crate) fn setup_outgoing_command(&mut self, shared: &mut Shared, mut outgoing: OutgoingCommand) {
        self.outgoing_data_total = self.outgoing_data_total.wrapping_add(
            command_size(outgoing.command.header.command) as u32
                + u32::from(outgoing.fragment_length),
        );

        if outgoing.command.header.channel_id == 0xFF {
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[usize::from(outgoing.command.header.channel_id)];

            if outgoing.command.header.command & COMMAND_FLAG_ACKNOWLEDGE != 0 {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_unreliable_sequence_number = 0;
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = 0;
            } else if outgoing.command.header.command & COMMAND_FLAG_UNSEQUENCED != 0 {
                self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
                outgoing.reliable_sequence_number = 0;
                outgoing.unreliable_sequence_number = 0;
            } else {
                if outgoing.fragment_offset == 0 {
                    channel.outgoing_unreliable_sequence_number =
                        channel.outgoing_unreliable_sequence_number.wrapping_add(1);
                }
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
            }
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.command.header.reliable_sequence_number = outgoing.reliable_sequence_number;
        shared.total_queued = shared.total_queued.wrapping_add(1);
        outgoing.queue_time = shared.total_queued;

        match &mut outgoing.command.body {
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => *unreliable_sequence_number = outgoing.unreliable_sequence_number,
            CommandBody::SendUnsequenced {
                unsequenced_group, ..
            } => *unsequenced_group = self.outgoing_unsequenced_group,
            _ => {}
        }

        let reliable_with_payload = outgoing.command.header.command & COMMAND_FLAG_ACKNOWLEDGE != 0
            && outgoing.packet.is_some();
        if reliable_with_payload {
            self.outgoing_send_reliable_commands
                .push_back(&mut self.outgoing_arena, outgoing);
        } else {
            self.outgoing_commands
                .push_back(&mut self.outgoing_arena, outgoing);
        }
    }

    pub(crate) fn queue_outgoing_command(
        &mut self,
        shared: &mut Shared,
        command: Command,
        packet: Option<Packet>,
        offset: u32,
        length: u16,
    ) {
        let outgoing = OutgoingCommand {
            command,
            packet: packet.map(|packet| packet.attach()),
            fragment_offset: offset,
            fragment_length: length,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            queue_time: 0,
            send_attempts: 0,
        };
        self.setup_outgoing_command(shared, outgoing);
    }

    /// File a received send command onto its channel queue, in sequence
    /// order, rejecting duplicates and out-of-window numbers.
    pub(crate) fn queue_incoming_command(
        &mut self,
        shared: &mut Shared,
        command: &Command,
        data: Option<&[u8]>,
        data_length: usize,
        packet_flags: u32,
        fragment_count: u32,
    ) -> Result<Inserted, ()> {
        let kind = command.kind();
        let channel_index = usize::from(command.header.channel_id);
        let reliable_sequence_number = command.header.reliable_sequence_number;

        let discard = |fragment_count: u32| {
            if fragment_count > 0 {
                Err(())
            } else {
                Ok(Inserted::Discarded)
            }
        };

        if self.state == PeerState::DisconnectLater {
            return discard(fragment_count);
        }

        let unreliable_sequence_number = match command.body {
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => unreliable_sequence_number,
            CommandBody::SendFragment(ref fragment) if kind == COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                fragment.start_sequence_number
            }
            _ => 0,
        };

        if kind != COMMAND_SEND_UNSEQUENCED {
            let channel = &self.channels[channel_index];
            if !channel.accepts_incoming(reliable_sequence_number) {
                return discard(fragment_count);
            }
        }

        enum Pos {
            Front,
            After(usize),
        }

        let pos = {
            let channel = &self.channels[channel_index];
            let arena = &self.incoming_arena;
            let current = channel.incoming_reliable_sequence_number;

            match kind {
                COMMAND_SEND_FRAGMENT | COMMAND_SEND_RELIABLE => {
                    if reliable_sequence_number == current {
                        return discard(fragment_count);
                    }

                    let mut cursor = channel.incoming_reliable_commands.back();
                    loop {
                        let index = match cursor {
                            Some(index) => index,
                            None => break Pos::Front,
                        };
                        let other = arena[index].reliable_sequence_number;

                        if reliable_sequence_number >= current {
                            if other < current {
                                cursor = arena.prev_of(index);
                                continue;
                            }
                        } else if other >= current {
                            break Pos::After(index);
                        }

                        if other <= reliable_sequence_number {
                            if other < reliable_sequence_number {
                                break Pos::After(index);
                            }
                            return discard(fragment_count);
                        }

                        cursor = arena.prev_of(index);
                    }
                }
                COMMAND_SEND_UNRELIABLE | COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                    if reliable_sequence_number == current
                        && unreliable_sequence_number
                            <= channel.incoming_unreliable_sequence_number
                    {
                        return discard(fragment_count);
                    }

                    let mut cursor = channel.incoming_unreliable_commands.back();
                    loop {
                        let index = match cursor {
                            Some(index) => index,
                            None => break Pos::Front,
                        };
                        let incoming = &arena[index];

                        if incoming.command.kind() == COMMAND_SEND_UNSEQUENCED {
                            cursor = arena.prev_of(index);
                            continue;
                        }

                        if reliable_sequence_number >= current {
                            if incoming.reliable_sequence_number < current {
                                cursor = arena.prev_of(index);
                                continue;
                            }
                        } else if incoming.reliable_sequence_number >= current {
                            break Pos::After(index);
                        }

                        if incoming.reliable_sequence_number < reliable_sequence_number {
                            break Pos::After(index);
                        }
                        if incoming.reliable_sequence_number > reliable_sequence_number {
                            cursor = arena.prev_of(index);
                            continue;
                        }

                        if incoming.unreliable_sequence_number <= unreliable_sequence_number {
                            if incoming.unreliable_sequence_number < unreliable_sequence_number {
                                break Pos::After(index);
                            }
                            return discard(fragment_count);
                        }

                        cursor = arena.prev_of(index);
                    }
                }
                // Unsequenced commands are not ordered; they park at the
                // head of the unreliable queue until the next dispatch
                // sweep picks them up.
                COMMAND_SEND_UNSEQUENCED => Pos::Front,
                _ => return discard(fragment_count),
            }
        };

        if self.total_waiting_data >= shared.maximum_waiting_data {
            return Err(());
        }

        let packet = match data {
            Some(data) => Packet::new(&data[..data_length], packet_flags),
            None => Packet::zeroed(data_length, packet_flags),
        };

        let fragments = if fragment_count > 0 {
            if fragment_count > MAXIMUM_FRAGMENT_COUNT {
                return Err(());
            }
            let words = (fragment_count as usize + 31) / 32;
            SmallVec::from_elem(0u32, words)
        } else {
            SmallVec::new()
        };

        let attached = packet.attach();
        self.total_waiting_data += attached.len();

        let incoming = IncomingCommand {
            command: *command,
            reliable_sequence_number,
            unreliable_sequence_number,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments,
            packet: attached,
        };

        let reliable_kind = kind == COMMAND_SEND_FRAGMENT || kind == COMMAND_SEND_RELIABLE;
        let index = {
            let channel = &mut self.channels[channel_index];
            let queue = if reliable_kind {
                &mut channel.incoming_reliable_commands
            } else {
                &mut channel.incoming_unreliable_commands
            };
            match pos {
                Pos::Front => queue.push_front(&mut self.incoming_arena, incoming),
                Pos::After(at) => queue.insert_after(&mut self.incoming_arena, at, incoming),
            }
        };

        if reliable_kind {
            self.dispatch_incoming_reliable_commands(shared, channel_index, Some(index));
        } else {
            self.dispatch_incoming_unreliable_commands(shared, channel_index, Some(index));
        }

        Ok(Inserted::Accepted(index))
    }

    /// Promote the contiguous ready prefix of a channel's reliable queue to
    /// the dispatched queue, then any unreliable commands the new anchor
    /// unblocks.
    pub(crate) fn dispatch_incoming_reliable_commands(
        &mut self,
        shared: &mut Shared,
        channel_index: usize,
        excluded: Option<usize>,
    ) {
        let mut promoted = false;
        let mut check_unreliable = false;

        {
            let channel = &mut self.channels[channel_index];
            let arena = &mut self.incoming_arena;

            let mut cursor = channel.incoming_reliable_commands.front();
            while let Some(index) = cursor {
                let incoming = &arena[index];
                if incoming.fragments_remaining > 0
                    || incoming.reliable_sequence_number
                        != channel.incoming_reliable_sequence_number.wrapping_add(1)
                {
                    break;
                }

                channel.incoming_reliable_sequence_number = incoming.reliable_sequence_number;
                if incoming.fragment_count > 0 {
                    channel.incoming_reliable_sequence_number = channel
                        .incoming_reliable_sequence_number
                        .wrapping_add(incoming.fragment_count as u16 - 1);
                }
                cursor = arena.next_of(index);
            }

            if cursor != channel.incoming_reliable_commands.front() {
                channel.incoming_unreliable_sequence_number = 0;

                let first = channel.incoming_reliable_commands.front().unwrap();
                let last = match cursor {
                    Some(next) => arena.prev_of(next).unwrap(),
                    None => channel.incoming_reliable_commands.back().unwrap(),
                };
                Queue::move_range(
                    arena,
                    &mut channel.incoming_reliable_commands,
                    &mut self.dispatched_commands,
                    first,
                    last,
                );
                promoted = true;
                check_unreliable = !channel.incoming_unreliable_commands.is_empty();
            }
        }

        if promoted {
            self.mark_needs_dispatch(shared);
        }
        if check_unreliable {
            self.dispatch_incoming_unreliable_commands(shared, channel_index, excluded);
        }
    }

    /// Walk a channel's unreliable queue promoting runs that are deliverable
    /// behind the current reliable anchor, dropping runs the anchor has
    /// already passed.
    pub(crate) fn dispatch_incoming_unreliable_commands(
        &mut self,
        shared: &mut Shared,
        channel_index: usize,
        excluded: Option<usize>,
    ) {
        let mut promoted = false;

        {
            let channel = &mut self.channels[channel_index];
            let arena = &mut self.incoming_arena;
            let dispatched = &mut self.dispatched_commands;

            let mut dropped = channel.incoming_unreliable_commands.front();
            let mut start = channel.incoming_unreliable_commands.front();
            let mut current = channel.incoming_unreliable_commands.front();

            while let Some(index) = current {
                let next = arena.next_of(index);

                if arena[index].command.kind() == COMMAND_SEND_UNSEQUENCED {
                    current = next;
                    continue;
                }

                if arena[index].reliable_sequence_number
                    == channel.incoming_reliable_sequence_number
                {
                    if arena[index].fragments_remaining == 0 {
                        channel.incoming_unreliable_sequence_number =
                            arena[index].unreliable_sequence_number;
                        current = next;
                        continue;
                    }

                    if start != Some(index) {
                        let first = start.unwrap();
                        let last = arena.prev_of(index).unwrap();
                        Queue::move_range(
                            arena,
                            &mut channel.incoming_unreliable_commands,
                            dispatched,
                            first,
                            last,
                        );
                        promoted = true;
                        dropped = Some(index);
                    } else if dropped != Some(index) {
                        dropped = arena.prev_of(index);
                    }
                } else {
                    let sequence_number = arena[index].reliable_sequence_number;
                    if channel.accepts_incoming(sequence_number) {
                        break;
                    }

                    dropped = next;

                    if start != Some(index) {
                        let first = start.unwrap();
                        let last = arena.prev_of(index).unwrap();
                        Queue::move_range(
                            arena,
                            &mut channel.incoming_unreliable_commands,
                            dispatched,
                            first,
                            last,
                        );
                        promoted = true;
                    }
                }

                start = next;
                current = next;
            }

            if start != current {
                let first = start.unwrap();
                let last = match current {
                    Some(next) => arena.prev_of(next).unwrap(),
                    None => channel.incoming_unreliable_commands.back().unwrap(),
                };
                Queue::move_range(
                    arena,
                    &mut channel.incoming_unreliable_commands,
                    dispatched,
                    first,
                    last,
                );
                promoted = true;
                dropped = current;
            }

            // Everything before the drop point is stale.
            let mut cursor = channel.incoming_unreliable_commands.front();
            while cursor != dropped {
                let index = cursor.unwrap();
                cursor = arena.next_of(index);
                if Some(index) == excluded {
                    continue;
                }
                let incoming = channel
                    .incoming_unreliable_commands
                    .remove(arena, index);
                trace!(
                    "dropping stale unreliable; channel={}; seq={}",
                    channel_index,
                    incoming.reliable_sequence_number
                );
                Packet::release(incoming.packet);
            }
        }

        if promoted {
            self.mark_needs_dispatch(shared);
        }
    }

    /// Remove the acknowledged reliable command, searching the not-yet-sent
    /// queues as well since an acknowledgement can race retransmission.
    /// Returns the removed command's kind, or `COMMAND_NONE`.
    pub(crate) fn remove_sent_reliable_command(
        &mut self,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> u8 {
        #[derive(Clone, Copy)]
        enum Owner {
            Sent,
            Outgoing,
            OutgoingSendReliable,
        }

        let arena = &self.outgoing_arena;

        let mut found = None;
        let mut cursor = self.sent_reliable_commands.front();
        while let Some(index) = cursor {
            let outgoing = &arena[index];
            if outgoing.reliable_sequence_number == reliable_sequence_number
                && outgoing.command.header.channel_id == channel_id
            {
                found = Some((index, Owner::Sent));
                break;
            }
            cursor = arena.next_of(index);
        }

        if found.is_none() {
            found = find_sent_reliable(
                arena,
                &self.outgoing_commands,
                reliable_sequence_number,
                channel_id,
            )
            .map(|index| (index, Owner::Outgoing));
        }
        if found.is_none() {
            found = find_sent_reliable(
                arena,
                &self.outgoing_send_reliable_commands,
                reliable_sequence_number,
                channel_id,
            )
            .map(|index| (index, Owner::OutgoingSendReliable));
        }

        let (index, owner) = match found {
            Some(found) => found,
            None => return COMMAND_NONE,
        };
        let was_sent = matches!(owner, Owner::Sent);

        if usize::from(channel_id) < self.channels.len() {
            let channel = &mut self.channels[usize::from(channel_id)];
            let reliable_window = reliable_sequence_number / RELIABLE_WINDOW_SIZE;
            if channel.reliable_windows[usize::from(reliable_window)] > 0 {
                channel.reliable_windows[usize::from(reliable_window)] -= 1;
                if channel.reliable_windows[usize::from(reliable_window)] == 0 {
                    channel.used_reliable_windows &= !(1 << reliable_window);
                }
            }
        }

        let outgoing = match owner {
            Owner::Sent => self
                .sent_reliable_commands
                .remove(&mut self.outgoing_arena, index),
            Owner::Outgoing => self
                .outgoing_commands
                .remove(&mut self.outgoing_arena, index),
            Owner::OutgoingSendReliable => self
                .outgoing_send_reliable_commands
                .remove(&mut self.outgoing_arena, index),
        };

        let command_number = outgoing.command.kind();

        if let Some(packet) = outgoing.packet {
            if was_sent {
                self.reliable_data_in_transit = self
                    .reliable_data_in_transit
                    .saturating_sub(u32::from(outgoing.fragment_length));
            }
            Packet::release_sent(packet);
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            let outgoing = &self.outgoing_arena[front];
            self.next_timeout = outgoing.sent_time.wrapping_add(outgoing.round_trip_timeout);
        }

        command_number
    }

    /// Drop the unreliable commands transmitted this pass, releasing their
    /// payload references. Returns whether a deferred disconnect should now
    /// proceed.
    pub(crate) fn remove_sent_unreliable_commands(&mut self) -> bool {
        if self.sent_unreliable_commands.is_empty() {
            return false;
        }

        while let Some(outgoing) = self
            .sent_unreliable_commands
            .pop_front(&mut self.outgoing_arena)
        {
            if let Some(packet) = outgoing.packet {
                Packet::release_sent(packet);
            }
        }

        self.state == PeerState::DisconnectLater && !self.has_outgoing_commands()
    }

    /// Retransmission scan: move timed-out reliable commands back to the
    /// outgoing queues with doubled timeouts. Returns true when the whole
    /// peer has exceeded its timeout budget.
    pub(crate) fn check_timeouts(&mut self, service_time: u32) -> bool {
        use crate::util::{time_diff, time_less};

        let outgoing_anchor = self.outgoing_commands.front();
        let send_reliable_anchor = self.outgoing_send_reliable_commands.front();

        let mut cursor = self.sent_reliable_commands.front();
        while let Some(index) = cursor {
            cursor = self.outgoing_arena.next_of(index);

            {
                let outgoing = &self.outgoing_arena[index];
                if time_diff(service_time, outgoing.sent_time) < outgoing.round_trip_timeout {
                    continue;
                }

                if self.earliest_timeout == 0
                    || time_less(outgoing.sent_time, self.earliest_timeout)
                {
                    self.earliest_timeout = outgoing.sent_time;
                }
            }

            let send_attempts = self.outgoing_arena[index].send_attempts;
            if self.earliest_timeout != 0
                && (time_diff(service_time, self.earliest_timeout) >= self.timeout_maximum
                    || (send_attempts > 0
                        && (1u32 << u32::from(send_attempts - 1).min(31)) >= self.timeout_limit
                        && time_diff(service_time, self.earliest_timeout)
                            >= self.timeout_minimum))
            {
                return true;
            }

            self.packets_lost += 1;

            let mut outgoing = self
                .sent_reliable_commands
                .remove(&mut self.outgoing_arena, index);
            outgoing.round_trip_timeout *= 2;

            trace!(
                "retransmit; peer={}; seq={}; attempts={}; timeout={}",
                self.incoming_peer_id,
                outgoing.reliable_sequence_number,
                outgoing.send_attempts,
                outgoing.round_trip_timeout
            );

            if outgoing.packet.is_some() {
                self.reliable_data_in_transit = self
                    .reliable_data_in_transit
                    .saturating_sub(u32::from(outgoing.fragment_length));
                match send_reliable_anchor {
                    Some(anchor) => {
                        self.outgoing_send_reliable_commands.insert_before(
                            &mut self.outgoing_arena,
                            anchor,
                            outgoing,
                        );
                    }
                    None => {
                        self.outgoing_send_reliable_commands
                            .push_back(&mut self.outgoing_arena, outgoing);
                    }
                }
            } else {
                match outgoing_anchor {
                    Some(anchor) => {
                        self.outgoing_commands.insert_before(
                            &mut self.outgoing_arena,
                            anchor,
                            outgoing,
                        );
                    }
                    None => {
                        self.outgoing_commands
                            .push_back(&mut self.outgoing_arena, outgoing);
                    }
                }
            }

            if cursor.is_some() && cursor == self.sent_reliable_commands.front() {
                let outgoing = &self.outgoing_arena[cursor.unwrap()];
                self.next_timeout = outgoing.sent_time.wrapping_add(outgoing.round_trip_timeout);
            }
        }

        false
    }
}

fn find_sent_reliable(
    arena: &Arena<OutgoingCommand>,
    queue: &Queue,
    reliable_sequence_number: u16,
    channel_id: u8,
) -> Option<usize> {
    let mut cursor = queue.front();
    while let Some(index) = cursor {
        let outgoing = &arena[index];
        cursor = arena.next_of(index);

        if outgoing.command.header.command & COMMAND_FLAG_ACKNOWLEDGE == 0 {
            continue;
        }
        if outgoing.send_attempts < 1 {
            break;
        }
        if outgoing.reliable_sequence_number == reliable_sequence_number
            && outgoing.command.header.channel_id == channel_id
        {
            return Some(index);
        }
    }
    None
}

fn reset_outgoing_queue(arena: &mut Arena<OutgoingCommand>, queue: &mut Queue) {
    while let Some(outgoing) = queue.pop_front(arena) {
        if let Some(packet) = outgoing.packet {
            Packet::release(packet);
        }
    }
}

fn reset_incoming_queue(arena: &mut Arena<IncomingCommand>, queue: &mut Queue) {
    while let Some(incoming) = queue.pop_front(arena) {
        Packet::release(incoming.packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_accelerates_on_fast_samples() {
        let mut peer = Peer::new(0, 1400);
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 10;
        peer.packet_throttle = 16;

        assert_eq!(peer.throttle(80), 1);
        assert_eq!(peer.packet_throttle, 16 + PACKET_THROTTLE_ACCELERATION);
    }

    #[test]
    fn throttle_decelerates_on_slow_samples() {
        let mut peer = Peer::new(0, 1400);
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 10;
        peer.packet_throttle = 16;

        assert_eq!(peer.throttle(130), -1);
        assert_eq!(peer.packet_throttle, 16 - PACKET_THROTTLE_DECELERATION);
    }

    #[test]
    fn throttle_saturates_at_zero_and_limit() {
        let mut peer = Peer::new(0, 1400);
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 10;

        peer.packet_throttle = 1;
        peer.throttle(1000);
        assert_eq!(peer.packet_throttle, 0);

        peer.packet_throttle = peer.packet_throttle_limit - 1;
        peer.throttle(50);
        assert_eq!(peer.packet_throttle, peer.packet_throttle_limit);
    }

    #[test]
    fn quiet_link_snaps_throttle_to_limit() {
        let mut peer = Peer::new(0, 1400);
        peer.last_round_trip_time = 5;
        peer.last_round_trip_time_variance = 10;
        peer.packet_throttle = 3;
        peer.packet_throttle_limit = 24;

        peer.throttle(500);
        assert_eq!(peer.packet_throttle, 24);
    }
}
