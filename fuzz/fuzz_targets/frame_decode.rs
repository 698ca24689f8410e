//! Arbitrary bytes through the frame decoder and both parse modes.
//!
//! The decoder's contract for hostile input: a success or a
//! failure-with-diagnostics, never a panic, never an unbounded
//! allocation (the 1 MiB frame cap must hold regardless of what the
//! length fields claim).

#![no_main]

use enp_proto::frame::decode_frame;
use enp_proto::registry::{parse_frame, ParseMode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some(result) = decode_frame(data) else {
        // clean EOF only ever comes from empty input
        assert!(data.is_empty());
        return;
    };

    if result.is_failure() {
        assert!(!result.diagnostics().is_empty(), "failures carry diagnostics");
    }

    if let Some(frame) = result.into_value() {
        let _ = parse_frame(&frame, ParseMode::Lenient);
        let _ = parse_frame(&frame, ParseMode::Strict);

        // whatever decoded must re-encode deterministically
        let wire = frame.encoded();
        assert_eq!(wire, frame.encoded());
    }
});
