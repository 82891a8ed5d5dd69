//! Fuzz target for SSH frame decoding.
//!
//! Feeds arbitrary bytes to the plaintext packet decoder and to the message
//! parsers that consume its output, looking for:
//! - Panics
//! - Oversized allocations driven by length fields
//! - Frames accepted with invalid padding
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use conch_proto::ssh::auth::AuthRequest;
use conch_proto::ssh::connection::ChannelMessage;
use conch_proto::ssh::kex::KexInit;
use conch_proto::ssh::packet::{CipherState, DEFAULT_MAX_PACKET_LEN};
use conch_proto::ssh::SoftwareBackend;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let backend = SoftwareBackend::new();

    if let Ok(payload) = CipherState::plaintext().open(&backend, data, DEFAULT_MAX_PACKET_LEN) {
        // An accepted frame re-seals to a frame of the same payload
        let frame = CipherState::plaintext()
            .seal(&backend, &payload, DEFAULT_MAX_PACKET_LEN)
            .expect("accepted payload must fit");
        let reopened = CipherState::plaintext()
            .open(&backend, &frame, DEFAULT_MAX_PACKET_LEN)
            .expect("sealed frame must open");
        assert_eq!(payload, reopened);

        let _ = KexInit::from_bytes(&payload);
        let _ = AuthRequest::from_bytes(&payload);
        let _ = ChannelMessage::from_bytes(&payload);
    }
});
