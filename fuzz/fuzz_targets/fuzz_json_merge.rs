//! Fuzz target for flat-JSON identity merges.
//!
//! Checks that merging identity fields into an arbitrary document changes
//! only those fields and keeps every other key where it was.

#![no_main]

use std::collections::BTreeMap;
use std::path::Path;

use arbitrary::Arbitrary;
use dg_core::store::json::{merge_fields, parse_document};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    document: String,
    fields: BTreeMap<String, String>,
}

fuzz_target!(|input: Input| {
    let Ok(original) = parse_document(Path::new("storage.json"), &input.document) else {
        return;
    };
    let mut merged = original.clone();
    merge_fields(&mut merged, &input.fields);

    for (key, value) in &input.fields {
        assert_eq!(merged.get(key).and_then(|v| v.as_str()), Some(value.as_str()));
    }
    let kept: Vec<&String> = merged.keys().filter(|k| original.contains_key(*k)).collect();
    let before: Vec<&String> = original.keys().collect();
    assert_eq!(kept, before);
    for (key, value) in &original {
        if !input.fields.contains_key(key) {
            assert_eq!(merged.get(key), Some(value));
        }
    }
});
