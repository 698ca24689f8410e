//! Arbitrary bytes through every tagged-value decoder.

#![no_main]

use enp_proto::values::{
    from_tagged_bytes, Binary, Bounds, Current, DurationMs, EnergyMix, Flag, IsolationState,
    Percentage, PriceForecast, SourceMix, Text, Timestamp, Voltage,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = from_tagged_bytes::<Voltage>(data);
    let _ = from_tagged_bytes::<Current>(data);
    let _ = from_tagged_bytes::<Percentage>(data);
    let _ = from_tagged_bytes::<DurationMs>(data);
    let _ = from_tagged_bytes::<Text>(data);
    let _ = from_tagged_bytes::<Flag>(data);
    let _ = from_tagged_bytes::<Binary>(data);
    let _ = from_tagged_bytes::<Timestamp>(data);
    let _ = from_tagged_bytes::<Bounds<Voltage>>(data);
    let _ = from_tagged_bytes::<SourceMix>(data);
    let _ = from_tagged_bytes::<EnergyMix>(data);
    let _ = from_tagged_bytes::<PriceForecast>(data);
    let _ = from_tagged_bytes::<IsolationState>(data);
});
