#![no_main]
use libfuzzer_sys::fuzz_target;
use volstore::{Arena, ImageCodec};

// Arbitrary bytes must load cleanly or fail with an error, never panic or
// abort. Both entry points are driven: `load` sizes its own arena from the
// header, `load_into` copies into a caller's arena.
fuzz_target!(|data: &[u8]| {
    let codec = ImageCodec::default();

    if let Ok(vol) = codec.load(data, Some("fuzz")) {
        vol.check_invariants().unwrap();
        let saved = codec.save(&vol, None).unwrap();
        codec.load(&saved, None).unwrap();
    }

    if let Ok(vol) = codec.load_into(data, Some("fuzz"), Arena::new(1 << 20)) {
        vol.check_invariants().unwrap();
    }
});
