//! Fuzz target for the endpoint ownership matrix.
//!
//! Run with: cargo +nightly fuzz run fuzz_endpoint_resolve
//!
//! Route matching runs on every HTTP request with an attacker-chosen path.
//! Arbitrary routes must resolve without panicking, and tunnel traffic must
//! never be admitted unless the daemon is tunneled.

#![no_main]

use homestead_core::endpoints::{check, resolve};
use homestead_core::{RuntimeState, Transport};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(route) = std::str::from_utf8(data) else {
        return;
    };
    let _ = resolve(route);

    for state in RuntimeState::ALL {
        if check(route, Transport::Tunnel, state).is_ok() {
            assert_eq!(state, RuntimeState::Tunneled, "{route:?}");
        }
    }
});
