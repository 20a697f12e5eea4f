use super::prelude::*;

use rand::{Rng, SeedableRng};

fn patterned(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

fn pump_until_received(pair: &mut Pair, secs: u64) -> Packet {
    let started = Instant::now();
    loop {
        assert!(
            !deadline_passed(started, secs),
            "fragmented payload never reassembled"
        );

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            return packet;
        }
    }
}

#[test]
fn large_reliable_payload_reassembles() {
    let mut pair = connected_pair(1, 0);

    // Well past the default 1400-byte MTU, so this fans out into several
    // fragments.
    let data = patterned(8000, 11);
    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(&data, Packet::RELIABLE)));

    let delivered = pump_until_received(&mut pair, 10);
    assert_eq!(delivered.len(), 8000);
    assert_eq!(&*delivered.data(), &data[..]);
}

#[test]
fn large_unreliable_fragment_payload_reassembles() {
    let mut pair = connected_pair(1, 0);

    let data = patterned(5000, 12);
    unwrap!(pair.client.send(
        pair.client_peer,
        0,
        Packet::new(&data, Packet::UNRELIABLE_FRAGMENT),
    ));

    let delivered = pump_until_received(&mut pair, 10);
    assert_eq!(&*delivered.data(), &data[..]);
}

#[test]
fn back_to_back_fragmented_payloads_stay_intact() {
    let mut pair = connected_pair(1, 0);

    let first = patterned(4000, 13);
    let second = patterned(9000, 14);
    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(&first, Packet::RELIABLE)));
    unwrap!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(&second, Packet::RELIABLE)));

    let mut delivered = Vec::new();
    let started = Instant::now();
    while delivered.len() < 2 {
        assert!(!deadline_passed(started, 10), "payloads never arrived");

        let _ = unwrap!(pair.client.service(5));
        if let Some(Event::Receive { packet, .. }) = unwrap!(pair.server.service(5)) {
            delivered.push(packet);
        }
    }

    assert_eq!(&*delivered[0].data(), &first[..]);
    assert_eq!(&*delivered[1].data(), &second[..]);
}

#[test]
fn oversized_payloads_are_refused() {
    let mut pair = connected_pair(1, 0);

    pair.client.set_maximum_packet_size(1000);

    let data = patterned(2000, 15);
    assert!(pair
        .client
        .send(pair.client_peer, 0, Packet::new(&data, Packet::RELIABLE))
        .is_err());
}
