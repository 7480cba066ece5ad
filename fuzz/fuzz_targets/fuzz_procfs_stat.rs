//! Fuzz target for `/proc/<pid>/stat` and `/proc/<pid>/cmdline` parsing.
//!
//! Tests that the procfs parsers handle arbitrary input without panicking.

#![no_main]

use dg_core::inspector::procfs::{parse_cmdline, parse_state};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = parse_cmdline(data);
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = parse_state(text);
    }
});
