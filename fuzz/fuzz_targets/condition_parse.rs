#![no_main]

use libfuzzer_sys::fuzz_target;

use berth::condition::parse;

fuzz_target!(|data: &[u8]| {
    // The condition language must reject or accept any input without
    // panicking; evaluation is not exercised here (it touches the fs).
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = parse(input);
    }
});
