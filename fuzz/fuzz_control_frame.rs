//! Fuzz target for control-channel frame decoding.
//!
//! Run with: cargo +nightly fuzz run fuzz_control_frame
//!
//! Every byte string reaching the control socket goes through
//! `decode_request`; it must reject garbage without panicking.

#![no_main]

use homestead_core::ipc::protocol::{MAX_FRAME_LEN, decode_request};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if decode_request(data).is_ok() {
        assert!(data.len() <= MAX_FRAME_LEN);
    }
});
