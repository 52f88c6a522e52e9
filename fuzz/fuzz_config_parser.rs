//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Exercises `AppConfig::parse()` with arbitrary byte sequences to find
//! panics or hangs in TOML parsing and validation.

#![no_main]

use homestead_config::AppConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = AppConfig::parse(s) {
        // Anything that validates must survive a round trip unchanged.
        let rendered = toml::to_string(&config).expect("valid config must serialize");
        let reparsed = AppConfig::parse(&rendered).expect("serialized config must parse");
        assert_eq!(config, reparsed);
    }
});
