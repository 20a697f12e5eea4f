//! Wire format.
//!
//! A datagram is a packed big-endian protocol header followed by up to
//! [`MAXIMUM_PACKET_COMMANDS`] command records. Every command starts with
//! the same 4-byte header; the tail layout is fixed per command kind, so
//! record sizes come from a table rather than the encoding itself.

use byteorder::{BigEndian, ByteOrder};

pub const MINIMUM_MTU: u32 = 576;
pub const MAXIMUM_MTU: u32 = 4096;
pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
pub const MINIMUM_CHANNEL_COUNT: usize = 1;
pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

pub const COMMAND_NONE: u8 = 0;
pub const COMMAND_ACKNOWLEDGE: u8 = 1;
pub const COMMAND_CONNECT: u8 = 2;
pub const COMMAND_VERIFY_CONNECT: u8 = 3;
pub const COMMAND_DISCONNECT: u8 = 4;
pub const COMMAND_PING: u8 = 5;
pub const COMMAND_SEND_RELIABLE: u8 = 6;
pub const COMMAND_SEND_UNRELIABLE: u8 = 7;
pub const COMMAND_SEND_FRAGMENT: u8 = 8;
pub const COMMAND_SEND_UNSEQUENCED: u8 = 9;
pub const COMMAND_BANDWIDTH_LIMIT: u8 = 10;
pub const COMMAND_THROTTLE_CONFIGURE: u8 = 11;
pub const COMMAND_SEND_UNRELIABLE_FRAGMENT: u8 = 12;
pub const COMMAND_COUNT: u8 = 13;

pub const COMMAND_MASK: u8 = 0x0F;

/// The command expects an acknowledgement from the remote end.
pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
/// The command bypasses sequencing entirely.
pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;

pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_COMPRESSED | HEADER_FLAG_SENT_TIME;

pub const HEADER_SESSION_MASK: u16 = 3 << 12;
pub const HEADER_SESSION_SHIFT: u16 = 12;

const COMMAND_SIZES: [usize; COMMAND_COUNT as usize] = [
    0,  // NONE
    8,  // ACKNOWLEDGE
    48, // CONNECT
    44, // VERIFY_CONNECT
    8,  // DISCONNECT
    4,  // PING
    6,  // SEND_RELIABLE
    8,  // SEND_UNRELIABLE
    24, // SEND_FRAGMENT
    8,  // SEND_UNSEQUENCED
    12, // BANDWIDTH_LIMIT
    16, // THROTTLE_CONFIGURE
    24, // SEND_UNRELIABLE_FRAGMENT
];

/// Encoded size of the command record (header included, payload excluded).
/// Zero means the command byte is not a recognized kind.
pub fn command_size(command: u8) -> usize {
    let kind = command & COMMAND_MASK;
    if kind >= COMMAND_COUNT {
        0
    } else {
        COMMAND_SIZES[kind as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub command: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectCommand {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
    pub data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyConnectCommand {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
}

/// Shared by `SEND_FRAGMENT` and `SEND_UNRELIABLE_FRAGMENT`; the command
/// byte's kind nibble tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentCommand {
    pub start_sequence_number: u16,
    pub data_length: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody {
    None,
    Acknowledge {
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
    },
    Connect(ConnectCommand),
    VerifyConnect(VerifyConnectCommand),
    Disconnect {
        data: u32,
    },
    Ping,
    SendReliable {
        data_length: u16,
    },
    SendUnreliable {
        unreliable_sequence_number: u16,
        data_length: u16,
    },
    SendUnsequenced {
        unsequenced_group: u16,
        data_length: u16,
    },
    SendFragment(FragmentCommand),
    BandwidthLimit {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ThrottleConfigure {
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub header: CommandHeader,
    pub body: CommandBody,
}

impl Command {
    pub fn new(command: u8, channel_id: u8, body: CommandBody) -> Command {
        Command {
            header: CommandHeader {
                command,
                channel_id,
                reliable_sequence_number: 0,
            },
            body,
        }
    }

    pub fn kind(&self) -> u8 {
        self.header.command & COMMAND_MASK
    }

    pub fn acknowledged(&self) -> bool {
        self.header.command & COMMAND_FLAG_ACKNOWLEDGE != 0
    }

    pub fn size(&self) -> usize {
        command_size(self.header.command)
    }

    /// Encode into `out`, which must hold at least `self.size()` bytes.
    /// Returns the encoded size.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        let size = self.size();
        debug_assert!(size > 0 && out.len() >= size);

        out[0] = self.header.command;
        out[1] = self.header.channel_id;
        BigEndian::write_u16(&mut out[2..4], self.header.reliable_sequence_number);

        match self.body {
            CommandBody::None | CommandBody::Ping => {}
            CommandBody::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => {
                BigEndian::write_u16(&mut out[4..6], received_reliable_sequence_number);
                BigEndian::write_u16(&mut out[6..8], received_sent_time);
            }
            CommandBody::Connect(ref connect) => {
                BigEndian::write_u16(&mut out[4..6], connect.outgoing_peer_id);
                out[6] = connect.incoming_session_id;
                out[7] = connect.outgoing_session_id;
                BigEndian::write_u32(&mut out[8..12], connect.mtu);
                BigEndian::write_u32(&mut out[12..16], connect.window_size);
                BigEndian::write_u32(&mut out[16..20], connect.channel_count);
                BigEndian::write_u32(&mut out[20..24], connect.incoming_bandwidth);
                BigEndian::write_u32(&mut out[24..28], connect.outgoing_bandwidth);
                BigEndian::write_u32(&mut out[28..32], connect.packet_throttle_interval);
                BigEndian::write_u32(&mut out[32..36], connect.packet_throttle_acceleration);
                BigEndian::write_u32(&mut out[36..40], connect.packet_throttle_deceleration);
                BigEndian::write_u32(&mut out[40..44], connect.connect_id);
                BigEndian::write_u32(&mut out[44..48], connect.data);
            }
            CommandBody::VerifyConnect(ref verify) => {
                BigEndian::write_u16(&mut out[4..6], verify.outgoing_peer_id);
                out[6] = verify.incoming_session_id;
                out[7] = verify.outgoing_session_id;
                BigEndian::write_u32(&mut out[8..12], verify.mtu);
                BigEndian::write_u32(&mut out[12..16], verify.window_size);
                BigEndian::write_u32(&mut out[16..20], verify.channel_count);
                BigEndian::write_u32(&mut out[20..24], verify.incoming_bandwidth);
                BigEndian::write_u32(&mut out[24..28], verify.outgoing_bandwidth);
                BigEndian::write_u32(&mut out[28..32], verify.packet_throttle_interval);
                BigEndian::write_u32(&mut out[32..36], verify.packet_throttle_acceleration);
                BigEndian::write_u32(&mut out[36..40], verify.packet_throttle_deceleration);
                BigEndian::write_u32(&mut out[40..44], verify.connect_id);
            }
            CommandBody::Disconnect { data } => {
                BigEndian::write_u32(&mut out[4..8], data);
            }
            CommandBody::SendReliable { data_length } => {
                BigEndian::write_u16(&mut out[4..6], data_length);
            }
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                data_length,
            } => {
                BigEndian::write_u16(&mut out[4..6], unreliable_sequence_number);
                BigEndian::write_u16(&mut out[6..8], data_length);
            }
            CommandBody::SendUnsequenced {
                unsequenced_group,
                data_length,
            } => {
                BigEndian::write_u16(&mut out[4..6], unsequenced_group);
                BigEndian::write_u16(&mut out[6..8], data_length);
            }
            CommandBody::SendFragment(ref fragment) => {
                BigEndian::write_u16(&mut out[4..6], fragment.start_sequence_number);
                BigEndian::write_u16(&mut out[6..8], fragment.data_length);
                BigEndian::write_u32(&mut out[8..12], fragment.fragment_count);
                BigEndian::write_u32(&mut out[12..16], fragment.fragment_number);
                BigEndian::write_u32(&mut out[16..20], fragment.total_length);
                BigEndian::write_u32(&mut out[20..24], fragment.fragment_offset);
            }
            CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                BigEndian::write_u32(&mut out[4..8], incoming_bandwidth);
                BigEndian::write_u32(&mut out[8..12], outgoing_bandwidth);
            }
            CommandBody::ThrottleConfigure {
                interval,
                acceleration,
                deceleration,
            } => {
                BigEndian::write_u32(&mut out[4..8], interval);
                BigEndian::write_u32(&mut out[8..12], acceleration);
                BigEndian::write_u32(&mut out[12..16], deceleration);
            }
        }

        size
    }

    /// Decode one command record from the front of `data`. `None` if the
    /// kind is unrecognized or the record is truncated. Payload bytes that
    /// follow variable-length sends are not consumed here.
    pub fn decode(data: &[u8]) -> Option<Command> {
        if data.len() < 4 {
            return None;
        }

        let command = data[0];
        let size = command_size(command);
        if size == 0 || data.len() < size {
            return None;
        }

        let header = CommandHeader {
            command,
            channel_id: data[1],
            reliable_sequence_number: BigEndian::read_u16(&data[2..4]),
        };

        let body = match command & COMMAND_MASK {
            COMMAND_ACKNOWLEDGE => CommandBody::Acknowledge {
                received_reliable_sequence_number: BigEndian::read_u16(&data[4..6]),
                received_sent_time: BigEndian::read_u16(&data[6..8]),
            },
            COMMAND_CONNECT => CommandBody::Connect(ConnectCommand {
                outgoing_peer_id: BigEndian::read_u16(&data[4..6]),
                incoming_session_id: data[6],
                outgoing_session_id: data[7],
                mtu: BigEndian::read_u32(&data[8..12]),
                window_size: BigEndian::read_u32(&data[12..16]),
                channel_count: BigEndian::read_u32(&data[16..20]),
                incoming_bandwidth: BigEndian::read_u32(&data[20..24]),
                outgoing_bandwidth: BigEndian::read_u32(&data[24..28]),
                packet_throttle_interval: BigEndian::read_u32(&data[28..32]),
                packet_throttle_acceleration: BigEndian::read_u32(&data[32..36]),
                packet_throttle_deceleration: BigEndian::read_u32(&data[36..40]),
                connect_id: BigEndian::read_u32(&data[40..44]),
                data: BigEndian::read_u32(&data[44..48]),
            }),
            COMMAND_VERIFY_CONNECT => CommandBody::VerifyConnect(VerifyConnectCommand {
                outgoing_peer_id: BigEndian::read_u16(&data[4..6]),
                incoming_session_id: data[6],
                outgoing_session_id: data[7],
                mtu: BigEndian::read_u32(&data[8..12]),
                window_size: BigEndian::read_u32(&data[12..16]),
                channel_count: BigEndian::read_u32(&data[16..20]),
                incoming_bandwidth: BigEndian::read_u32(&data[20..24]),
                outgoing_bandwidth: BigEndian::read_u32(&data[24..28]),
                packet_throttle_interval: BigEndian::read_u32(&data[28..32]),
                packet_throttle_acceleration: BigEndian::read_u32(&data[32..36]),
                packet_throttle_deceleration: BigEndian::read_u32(&data[36..40]),
                connect_id: BigEndian::read_u32(&data[40..44]),
            }),
            COMMAND_DISCONNECT => CommandBody::Disconnect {
                data: BigEndian::read_u32(&data[4..8]),
            },
            COMMAND_PING => CommandBody::Ping,
            COMMAND_SEND_RELIABLE => CommandBody::SendReliable {
                data_length: BigEndian::read_u16(&data[4..6]),
            },
            COMMAND_SEND_UNRELIABLE => CommandBody::SendUnreliable {
                unreliable_sequence_number: BigEndian::read_u16(&data[4..6]),
                data_length: BigEndian::read_u16(&data[6..8]),
            },
            COMMAND_SEND_UNSEQUENCED => CommandBody::SendUnsequenced {
                unsequenced_group: BigEndian::read_u16(&data[4..6]),
                data_length: BigEndian::read_u16(&data[6..8]),
            },
            COMMAND_SEND_FRAGMENT | COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                CommandBody::SendFragment(FragmentCommand {
                    start_sequence_number: BigEndian::read_u16(&data[4..6]),
                    data_length: BigEndian::read_u16(&data[6..8]),
                    fragment_count: BigEndian::read_u32(&data[8..12]),
                    fragment_number: BigEndian::read_u32(&data[12..16]),
                    total_length: BigEndian::read_u32(&data[16..20]),
                    fragment_offset: BigEndian::read_u32(&data[20..24]),
                })
            }
            _ => return None,
        };

        Some(Command { header, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(command: Command) -> Command {
        let mut buf = [0u8; 64];
        let size = command.encode(&mut buf);
        assert_eq!(size, command.size());

        let decoded = Command::decode(&buf[..size]).unwrap();
        assert_eq!(decoded, command);
        decoded
    }

    #[test]
    fn connect_round_trips() {
        let mut command = Command::new(
            COMMAND_CONNECT | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Connect(ConnectCommand {
                outgoing_peer_id: 7,
                incoming_session_id: 0xFF,
                outgoing_session_id: 0xFF,
                mtu: 1400,
                window_size: 32 * 1024,
                channel_count: 2,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 57600,
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
                connect_id: 0xDEAD_BEEF,
                data: 0xABCD,
            }),
        );
        command.header.reliable_sequence_number = 1;

        let decoded = round_trip(command);
        assert!(decoded.acknowledged());
        assert_eq!(decoded.kind(), COMMAND_CONNECT);
    }

    #[test]
    fn fragment_round_trips_for_both_kinds() {
        for kind in [COMMAND_SEND_FRAGMENT, COMMAND_SEND_UNRELIABLE_FRAGMENT] {
            let command = Command::new(
                kind,
                3,
                CommandBody::SendFragment(FragmentCommand {
                    start_sequence_number: 17,
                    data_length: 1372,
                    fragment_count: 6,
                    fragment_number: 5,
                    total_length: 8000,
                    fragment_offset: 6860,
                }),
            );
            round_trip(command);
        }
    }

    #[test]
    fn acknowledge_and_sends_round_trip() {
        round_trip(Command::new(
            COMMAND_ACKNOWLEDGE,
            2,
            CommandBody::Acknowledge {
                received_reliable_sequence_number: 42,
                received_sent_time: 0x8001,
            },
        ));
        round_trip(Command::new(
            COMMAND_SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE,
            0,
            CommandBody::SendReliable { data_length: 5 },
        ));
        round_trip(Command::new(
            COMMAND_SEND_UNSEQUENCED | COMMAND_FLAG_UNSEQUENCED,
            1,
            CommandBody::SendUnsequenced {
                unsequenced_group: 9,
                data_length: 100,
            },
        ));
    }

    #[test]
    fn sizes_match_the_wire_layout() {
        assert_eq!(command_size(COMMAND_ACKNOWLEDGE), 8);
        assert_eq!(command_size(COMMAND_CONNECT | COMMAND_FLAG_ACKNOWLEDGE), 48);
        assert_eq!(command_size(COMMAND_VERIFY_CONNECT), 44);
        assert_eq!(command_size(COMMAND_PING), 4);
        assert_eq!(command_size(COMMAND_SEND_RELIABLE), 6);
        assert_eq!(command_size(COMMAND_SEND_FRAGMENT), 24);
        assert_eq!(command_size(COMMAND_SEND_UNRELIABLE_FRAGMENT), 24);
        assert_eq!(command_size(COMMAND_COUNT), 0);
        assert_eq!(command_size(0x1F), 0);
    }

    #[test]
    fn truncated_records_are_rejected() {
        let command = Command::new(
            COMMAND_DISCONNECT,
            0xFF,
            CommandBody::Disconnect { data: 99 },
        );
        let mut buf = [0u8; 8];
        command.encode(&mut buf);

        assert!(Command::decode(&buf[..7]).is_none());
        assert!(Command::decode(&buf[..3]).is_none());
        assert!(Command::decode(&[]).is_none());
    }
}
