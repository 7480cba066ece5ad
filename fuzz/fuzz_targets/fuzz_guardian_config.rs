//! Fuzz target for guardian config parsing.
//!
//! A standalone guardian trusts nothing but this file, so parsing must
//! reject malformed input without panicking, and anything it accepts must
//! survive a write/read cycle unchanged.

#![no_main]

use dg_common::GuardianConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let Ok(config) = GuardianConfig::from_json_str(data) else {
        return;
    };
    let text = config.to_json_pretty().expect("accepted config serializes");
    let reparsed = GuardianConfig::from_json_str(&text).expect("written config parses");
    assert_eq!(config, reparsed);
});
