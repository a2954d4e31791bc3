//! Fuzz target for SSH binary packet parsing and packet opening.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use strand_proto::ssh::packet::MAX_PACKET_LENGTH;
use strand_proto::ssh::{Packet, PacketOpener};

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let serialized = packet.to_bytes();
        let reparsed = Packet::from_bytes(&serialized).expect("Re-encoded packet must parse");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    // Streamed input: every frame either opens, waits for more bytes or fails.
    let mut opener = PacketOpener::clear();
    let mut buf = BytesMut::from(data);
    let mut seq = 0u32;
    while let Ok(Some(_payload)) = opener.open(seq, &mut buf, MAX_PACKET_LENGTH) {
        seq = seq.wrapping_add(1);
    }
});
