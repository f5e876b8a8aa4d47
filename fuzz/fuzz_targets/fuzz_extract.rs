#![no_main]
use libfuzzer_sys::fuzz_target;
use manifest_survival::{extract, Confidence, RecoveredPayload};

// Hostile asset bytes must never panic, and a high-confidence result must
// always hash to what it claims
fuzz_target!(|data: &[u8]| {
    let result = extract(data);
    assert_eq!(result.attempts().len(), 3);

    if result.confidence() == Confidence::High {
        match result.payload() {
            Some(RecoveredPayload::Manifest { hash, bytes }) => assert!(hash.matches(bytes)),
            other => panic!("high confidence without a manifest: {:?}", other),
        }
    }
});
