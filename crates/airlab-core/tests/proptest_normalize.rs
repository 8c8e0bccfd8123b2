//! Property-based tests for payload normalization.
//!
//! The normalizer takes untrusted bytes, so these check that it never panics
//! and only ever emits canonical metrics with the values it was given.

use proptest::prelude::*;

use airlab_core::metric::{CanonicalMetric, FIELD_ALIASES};
use airlab_core::normalize::{Normalized, Normalizer};

fn normalizer() -> Normalizer {
    Normalizer::new("airlab", "/config")
}

// =============================================================================
// Strategies
// =============================================================================

fn arb_alias() -> impl Strategy<Value = (&'static str, CanonicalMetric)> {
    prop::sample::select(FIELD_ALIASES.to_vec())
}

fn arb_finite() -> impl Strategy<Value = f64> {
    prop_oneof![
        (-1.0e6f64..1.0e6),
        (-1000i64..10_000).prop_map(|v| v as f64),
    ]
}

/// Channel segments that never canonicalize.
fn arb_plain_segment() -> impl Strategy<Value = String> {
    "[a-z]{1,6}_[0-9]{1,3}"
}

// =============================================================================
// Robustness
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Arbitrary bytes on an arbitrary channel never panic.
    #[test]
    fn arbitrary_bytes_never_panic(
        channel in ".{0,40}",
        payload in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let _ = normalizer().classify(&channel, &payload);
    }

    /// Arbitrary text shaped like JSON never panics.
    #[test]
    fn json_like_text_never_panics(payload in r#"[{}\[\]":, 0-9a-z.eE+-]{0,80}"#) {
        let _ = normalizer().normalize("airlab/state", payload.as_bytes());
    }

    /// Metadata channels are skipped whatever they carry.
    #[test]
    fn metadata_channels_are_always_skipped(
        segment in arb_plain_segment(),
        (alias, _metric) in arb_alias(),
        value in arb_finite(),
    ) {
        let channel = format!("airlab/{segment}/{alias}/config");
        let payload = format!(r#"{{"{alias}": {value}}}"#);
        prop_assert_eq!(
            normalizer().classify(&channel, payload.as_bytes()),
            Normalized::Metadata
        );
    }
}

// =============================================================================
// Extraction
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Structured objects yield exactly the aliased fields, with their values.
    #[test]
    fn structured_object_extracts_aliased_fields(
        fields in prop::collection::vec((arb_alias(), arb_finite()), 1..6),
        junk in prop::collection::vec((arb_plain_segment(), arb_finite()), 0..4),
    ) {
        let mut object = serde_json::Map::new();
        for ((alias, _), value) in &fields {
            object.insert((*alias).to_string(), serde_json::json!(value));
        }
        for (key, value) in &junk {
            object.insert(key.clone(), serde_json::json!(value));
        }
        let payload = serde_json::Value::Object(object).to_string();

        let reading = normalizer().normalize("airlab/state", payload.as_bytes());

        prop_assert!(!reading.is_empty());
        for (metric, value) in reading.iter() {
            prop_assert!(value.is_finite(), "{} = {}", metric, value);
            prop_assert!(
                fields.iter().any(|((_, m), v)| *m == metric && *v == value),
                "{}={} not in input", metric, value
            );
        }
        for ((_, metric), _) in &fields {
            prop_assert!(reading.get(*metric).is_some(), "{} missing", metric);
        }
    }

    /// A scalar on `<base>/.../<alias>` yields that one metric.
    #[test]
    fn scalar_on_alias_channel_yields_one_metric(
        device in arb_plain_segment(),
        (alias, metric) in arb_alias(),
        value in arb_finite(),
        padding in "[ \t]{0,2}",
    ) {
        let channel = format!("airlab/{device}/{alias}");
        let payload = format!("{padding}{value}{padding}");

        match normalizer().classify(&channel, payload.as_bytes()) {
            Normalized::Accepted { shape, reading } => {
                prop_assert_eq!(shape, "scalar_per_channel");
                prop_assert_eq!(reading.len(), 1);
                prop_assert_eq!(reading.get(metric), Some(value));
            }
            other => prop_assert!(false, "expected accepted reading, got {:?}", other),
        }
    }

    /// Channels with no alias segment carry nothing, however numeric the payload.
    #[test]
    fn scalar_on_unknown_channel_is_unrecognized(
        segments in prop::collection::vec(arb_plain_segment(), 1..4),
        value in arb_finite(),
    ) {
        let channel = format!("airlab/{}", segments.join("/"));
        prop_assert_eq!(
            normalizer().classify(&channel, value.to_string().as_bytes()),
            Normalized::Unrecognized
        );
    }
}
