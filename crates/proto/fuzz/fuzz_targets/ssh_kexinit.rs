//! Fuzz target for KEXINIT and connection message parsing.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_kexinit -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use strand_proto::ssh::connection::{ChannelOpenConfirmation, ChannelRequest, GlobalRequest};
use strand_proto::ssh::kex::{KexInit, NegotiatedAlgorithms};

fuzz_target!(|data: &[u8]| {
    if let Ok(remote) = KexInit::from_bytes(data) {
        let local = KexInit::new_default();
        let _ = NegotiatedAlgorithms::negotiate(&local, &remote, true);
        let _ = NegotiatedAlgorithms::negotiate(&local, &remote, false);
    }

    let _ = ChannelOpenConfirmation::from_bytes(data);
    let _ = ChannelRequest::from_bytes(data);
    let _ = GlobalRequest::from_bytes(data);
});
