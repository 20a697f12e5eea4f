use super::prelude::*;

use byteorder::{BigEndian, ByteOrder};

/// Groups advance one per unsequenced packet, so sending well past 1024 of
/// them cycles the receive window at least once.
#[test]
fn unsequenced_batch_is_delivered_without_duplicates() {
    const TOTAL: u16 = 1200;
    const BATCH: u16 = 100;

    let mut pair = connected_pair(1, 0);

    let mut seen = vec![0u32; usize::from(TOTAL)];
    let mut delivered = 0u32;
    let mut sent = 0u16;

    let started = Instant::now();
    while delivered < u32::from(TOTAL) {
        assert!(
            !deadline_passed(started, 30),
            "only {} of {} unsequenced packets arrived",
            delivered,
            TOTAL
        );

        if sent < TOTAL {
            let batch_end = (sent + BATCH).min(TOTAL);
            while sent < batch_end {
                let mut payload = [0u8; 2];
                BigEndian::write_u16(&mut payload, sent);
                unwrap!(pair.client.send(
                    pair.client_peer,
                    0,
                    Packet::new(&payload, Packet::UNSEQUENCED),
                ));
                sent += 1;
            }
        }

        let _ = unwrap!(pair.client.service(5));

        let mut pending = unwrap!(pair.server.service(5));
        while let Some(event) = pending {
            if let Event::Receive { packet, .. } = event {
                assert_ne!(packet.flags() & Packet::UNSEQUENCED, 0);
                let index = BigEndian::read_u16(&packet.data());
                seen[usize::from(index)] += 1;
                delivered += 1;
            }
            pending = pair.server.check_events();
        }
    }

    for (index, count) in seen.iter().enumerate() {
        assert_eq!(*count, 1, "packet {} delivered {} times", index, count);
    }
}

#[test]
fn unsequenced_flag_survives_delivery() {
    let mut pair = connected_pair(1, 0);

    unwrap!(pair.client.send(
        pair.client_peer,
        0,
        Packet::new(b"free", Packet::UNSEQUENCED),
    ));

    let started = Instant::now();
    loop {
        assert!(!deadline_passed(started, 10), "packet never arrived");

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            assert_eq!(&*packet.data(), b"free");
            assert_ne!(packet.flags() & Packet::UNSEQUENCED, 0);
            break;
        }
    }
}
