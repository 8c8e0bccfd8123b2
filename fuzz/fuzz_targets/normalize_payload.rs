#![no_main]

use airlab_core::metric::CanonicalMetric;
use airlab_core::normalize::{Normalized, Normalizer};
use airlab_core::validate::check_reading;
use libfuzzer_sys::fuzz_target;

const CHANNELS: [&str; 6] = [
    "airlab/state",
    "airlab/sensor1/co2",
    "airlab/sensor1/Temperature",
    "airlab/sensor/co2/config",
    "other/rh",
    "",
];

fuzz_target!(|data: &[u8]| {
    let Some((&selector, payload)) = data.split_first() else {
        return;
    };

    // Either a fixed channel or one carved out of the input itself.
    let (channel, payload) = if selector & 0x80 == 0 {
        (CHANNELS[usize::from(selector) % CHANNELS.len()].to_string(), payload)
    } else {
        let split = usize::from(selector & 0x3f).min(payload.len());
        let (raw_channel, rest) = payload.split_at(split);
        (String::from_utf8_lossy(raw_channel).into_owned(), rest)
    };

    let normalizer = Normalizer::new("airlab", "/config");
    match normalizer.classify(&channel, payload) {
        Normalized::Metadata => assert!(channel.ends_with("/config")),
        Normalized::Unrecognized => {}
        Normalized::Accepted { reading, .. } => {
            assert!(!reading.is_empty());
            assert!(reading.len() <= CanonicalMetric::ALL.len());
            // Validation must classify every value, including NaN and infinities.
            let report = check_reading(&reading);
            for violation in &report.violations {
                assert!(reading.get(violation.metric).is_some());
            }
        }
    }
});
