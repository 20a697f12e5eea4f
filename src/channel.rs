use crate::queue::Queue;

/// Reliable sequence space is partitioned into windows for admission
/// control; only a span of free windows ahead of the delivery cursor may
/// hold in-flight commands, which bounds reordering across the 16-bit wrap.
pub const RELIABLE_WINDOWS: u16 = 16;
pub const RELIABLE_WINDOW_SIZE: u16 = 0x1000;
pub const FREE_RELIABLE_WINDOWS: u16 = 8;

/// Per-(peer, channel id) sequencing state. The incoming queues hold
/// indices into the owning peer's incoming-command arena.
#[derive(Debug)]
pub struct Channel {
    pub outgoing_reliable_sequence_number: u16,
    pub outgoing_unreliable_sequence_number: u16,
    pub used_reliable_windows: u16,
    pub reliable_windows: [u16; RELIABLE_WINDOWS as usize],
    pub incoming_reliable_sequence_number: u16,
    pub incoming_unreliable_sequence_number: u16,
    pub incoming_reliable_commands: Queue,
    pub incoming_unreliable_commands: Queue,
}

impl Channel {
    pub fn new() -> Channel {
        Channel {
            outgoing_reliable_sequence_number: 0,
            outgoing_unreliable_sequence_number: 0,
            used_reliable_windows: 0,
            reliable_windows: [0; RELIABLE_WINDOWS as usize],
            incoming_reliable_sequence_number: 0,
            incoming_unreliable_sequence_number: 0,
            incoming_reliable_commands: Queue::new(),
            incoming_unreliable_commands: Queue::new(),
        }
    }

    /// Window index of `sequence_number` relative to the incoming cursor,
    /// unwrapped past `RELIABLE_WINDOWS` when the number is behind it.
    pub fn incoming_window_of(&self, sequence_number: u16) -> u16 {
        let mut window = sequence_number / RELIABLE_WINDOW_SIZE;
        if sequence_number < self.incoming_reliable_sequence_number {
            window += RELIABLE_WINDOWS;
        }
        window
    }

    pub fn current_incoming_window(&self) -> u16 {
        self.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE
    }

    /// Whether a newly received reliable number is inside the span of
    /// windows currently accepted for this channel.
    pub fn accepts_incoming(&self, sequence_number: u16) -> bool {
        let window = self.incoming_window_of(sequence_number);
        let current = self.current_incoming_window();
        window >= current && window < current + FREE_RELIABLE_WINDOWS - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_admission_tracks_the_cursor() {
        let mut channel = Channel::new();

        assert!(channel.accepts_incoming(1));
        assert!(channel.accepts_incoming((FREE_RELIABLE_WINDOWS - 1) * RELIABLE_WINDOW_SIZE - 1));
        // First window past the free span is refused.
        assert!(!channel.accepts_incoming((FREE_RELIABLE_WINDOWS - 1) * RELIABLE_WINDOW_SIZE));

        channel.incoming_reliable_sequence_number = 5 * RELIABLE_WINDOW_SIZE;
        assert!(channel.accepts_incoming(5 * RELIABLE_WINDOW_SIZE + 1));
        assert!(!channel.accepts_incoming(4 * RELIABLE_WINDOW_SIZE));
    }

    #[test]
    fn admission_survives_sequence_wrap() {
        let mut channel = Channel::new();
        channel.incoming_reliable_sequence_number = 15 * RELIABLE_WINDOW_SIZE + 17;

        // Numbers that wrapped past zero sit in unwrapped windows 16.. and
        // stay inside the free span.
        assert!(channel.accepts_incoming(3));
        assert_eq!(channel.incoming_window_of(3), RELIABLE_WINDOWS);

        // Far-behind numbers in the same lap are refused.
        assert!(!channel.accepts_incoming(7 * RELIABLE_WINDOW_SIZE));
    }
}
