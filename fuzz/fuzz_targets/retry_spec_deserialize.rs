#![no_main]

use libfuzzer_sys::fuzz_target;

use berth_retry::RetrySpec;

fuzz_target!(|data: &[u8]| {
    if let Ok(spec) = serde_json::from_slice::<RetrySpec>(data) {
        // Any parsed spec must produce finite, monotone delays.
        let mut last = std::time::Duration::ZERO;
        for attempt in 1..=10 {
            let delay = spec.delay_before_attempt(attempt);
            if spec.exponential_backoff {
                assert!(delay >= last);
            }
            last = delay;
        }
    }
});
