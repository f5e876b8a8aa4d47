#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use manifest_survival::{embed, CarrierFormat};

#[derive(Arbitrary, Debug)]
struct Input {
    carrier: Vec<u8>,
    manifest: Vec<u8>,
    format: u8,
}

// Malformed carriers degrade instead of panicking, and degrade to the
// exact input bytes
fuzz_target!(|input: Input| {
    let format = match input.format % 3 {
        0 => CarrierFormat::Jpeg,
        1 => CarrierFormat::Png,
        _ => CarrierFormat::WebP,
    };
    let out = embed(&input.carrier, &input.manifest, format);
    if out.result.fallback_used {
        assert_eq!(out.bytes, input.carrier);
        assert_eq!(out.result.bytes_written, 0);
    }
});
