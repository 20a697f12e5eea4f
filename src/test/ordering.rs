use super::prelude::*;

/// Reliable delivery is strictly ordered within a channel, and channels do
/// not interleave their sequencing.
#[test]
fn channels_deliver_independently_in_order() {
    const PER_CHANNEL: u8 = 20;

    let mut pair = connected_pair(2, 0);

    for sequence in 0..PER_CHANNEL {
        for channel in 0..2u8 {
            unwrap!(pair.client.send(
                pair.client_peer,
                channel,
                Packet::new(&[channel, sequence], Packet::RELIABLE),
            ));
        }
    }

    let mut next_expected = [0u8; 2];
    let mut total = 0u32;

    let started = Instant::now();
    while total < u32::from(PER_CHANNEL) * 2 {
        assert!(
            !deadline_passed(started, 15),
            "only {} payloads arrived",
            total
        );

        let _ = unwrap!(pair.client.service(5));

        let mut pending = unwrap!(pair.server.service(5));
        while let Some(event) = pending {
            if let Event::Receive { channel_id, packet, .. } = event {
                let data = packet.data();
                assert_eq!(data[0], channel_id);
                assert_eq!(
                    data[1],
                    next_expected[usize::from(channel_id)],
                    "channel {} delivered out of order",
                    channel_id
                );
                next_expected[usize::from(channel_id)] += 1;
                total += 1;
            }
            pending = pair.server.check_events();
        }
    }

    assert_eq!(next_expected, [PER_CHANNEL, PER_CHANNEL]);
}

/// A stream of small reliable payloads arrives exactly once, in order,
/// even when queued faster than one datagram can carry them.
#[test]
fn long_reliable_stream_keeps_order() {
    const TOTAL: u16 = 300;

    let mut pair = connected_pair(1, 0);

    for sequence in 0..TOTAL {
        unwrap!(pair.client.send(
            pair.client_peer,
            0,
            Packet::new(&sequence.to_be_bytes(), Packet::RELIABLE),
        ));
    }

    let mut next_expected = 0u16;

    let started = Instant::now();
    while next_expected < TOTAL {
        assert!(
            !deadline_passed(started, 20),
            "stream stalled at {}",
            next_expected
        );

        let _ = unwrap!(pair.client.service(5));

        let mut pending = unwrap!(pair.server.service(5));
        while let Some(event) = pending {
            if let Event::Receive { packet, .. } = event {
                let got = u16::from_be_bytes([packet.data()[0], packet.data()[1]]);
                assert_eq!(got, next_expected);
                next_expected += 1;
            }
            pending = pair.server.check_events();
        }
    }
}
