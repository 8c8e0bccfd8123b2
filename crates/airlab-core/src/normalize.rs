//! Payload normalization.
//!
//! Turns one raw bus message into a partial [`Reading`]. Payload shapes are
//! tried in order through the [`PayloadShape`] trait; the first shape that
//! yields a non-empty reading wins. Nothing in here returns an error:
//! malformed or unrecognized input normalizes to an empty reading.

use serde_json::Value;

use crate::metric::canonicalize;
use crate::reading::Reading;

/// One way of interpreting a payload.
pub trait PayloadShape: Send + Sync {
    /// Short name used in trace logs.
    fn name(&self) -> &'static str;

    /// Extract canonical fields, or `None` when the payload is not this shape.
    fn parse(&self, channel: &str, payload: &str) -> Option<Reading>;
}

/// A JSON object of `field -> value` pairs, e.g. `{"co2": 800, "temp": 21.5}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredObject;

impl PayloadShape for StructuredObject {
    fn name(&self) -> &'static str {
        "structured_object"
    }

    fn parse(&self, _channel: &str, payload: &str) -> Option<Reading> {
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(payload) else {
            return None;
        };

        let mut reading = Reading::new();
        for (key, value) in &map {
            let Some(metric) = canonicalize(key) else {
                continue;
            };
            if let Some(number) = coerce_json(value) {
                reading.insert(metric, number);
            }
        }
        Some(reading)
    }
}

/// A single scalar addressed by the channel path, e.g. `airlab/sensor1/co2` -> `800`.
#[derive(Debug, Clone)]
pub struct ScalarPerChannel {
    base_topic: String,
}

impl ScalarPerChannel {
    #[must_use]
    pub fn new(base_topic: impl Into<String>) -> Self {
        Self {
            base_topic: base_topic.into(),
        }
    }

    fn relative<'a>(&self, channel: &'a str) -> &'a str {
        channel
            .strip_prefix(self.base_topic.as_str())
            .map_or(channel, |rest| rest.trim_matches('/'))
    }
}

impl PayloadShape for ScalarPerChannel {
    fn name(&self) -> &'static str {
        "scalar_per_channel"
    }

    fn parse(&self, channel: &str, payload: &str) -> Option<Reading> {
        // Most specific segment first.
        let metric = self.relative(channel).rsplit('/').find_map(canonicalize)?;
        let value = coerce_str(payload)?;
        Some([(metric, value)].into_iter().collect())
    }
}

/// Outcome of normalizing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// Discovery/configuration metadata; skipped before any parsing.
    Metadata,
    /// No shape produced a canonical field.
    Unrecognized,
    /// At least one canonical field was extracted by the named shape.
    Accepted { shape: &'static str, reading: Reading },
}

impl Normalized {
    /// The extracted fields; empty unless accepted.
    #[must_use]
    pub fn into_reading(self) -> Reading {
        match self {
            Self::Accepted { reading, .. } => reading,
            Self::Metadata | Self::Unrecognized => Reading::new(),
        }
    }
}

/// Ordered list of payload shapes plus the metadata-suffix filter.
pub struct Normalizer {
    shapes: Vec<Box<dyn PayloadShape>>,
    metadata_suffix: String,
}

impl std::fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.shapes.iter().map(|shape| shape.name()).collect();
        f.debug_struct("Normalizer")
            .field("shapes", &names)
            .field("metadata_suffix", &self.metadata_suffix)
            .finish()
    }
}

impl Normalizer {
    /// Structured objects first, then scalar-per-channel under `base_topic`.
    #[must_use]
    pub fn new(base_topic: &str, metadata_suffix: &str) -> Self {
        Self {
            shapes: vec![
                Box::new(StructuredObject),
                Box::new(ScalarPerChannel::new(base_topic)),
            ],
            metadata_suffix: metadata_suffix.to_string(),
        }
    }

    /// Append a shape tried after the existing ones.
    pub fn push_shape(&mut self, shape: Box<dyn PayloadShape>) {
        self.shapes.push(shape);
    }

    #[must_use]
    pub fn is_metadata(&self, channel: &str) -> bool {
        !self.metadata_suffix.is_empty() && channel.ends_with(self.metadata_suffix.as_str())
    }

    /// Classify and extract one message.
    #[must_use]
    pub fn classify(&self, channel: &str, payload: &[u8]) -> Normalized {
        if self.is_metadata(channel) {
            return Normalized::Metadata;
        }

        let text = String::from_utf8_lossy(payload);
        let text = text.trim();

        for shape in &self.shapes {
            match shape.parse(channel, text) {
                Some(reading) if !reading.is_empty() => {
                    return Normalized::Accepted {
                        shape: shape.name(),
                        reading,
                    };
                }
                _ => {}
            }
        }
        Normalized::Unrecognized
    }

    /// Extract canonical fields; empty when nothing was recognized.
    #[must_use]
    pub fn normalize(&self, channel: &str, payload: &[u8]) -> Reading {
        self.classify(channel, payload).into_reading()
    }
}

/// Numeric coercion for JSON values. Booleans count as 1/0.
fn coerce_json(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => coerce_str(text),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn coerce_str(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::CanonicalMetric;

    fn normalizer() -> Normalizer {
        Normalizer::new("airlab", "/config")
    }

    fn reading(pairs: &[(CanonicalMetric, f64)]) -> Reading {
        pairs.iter().copied().collect()
    }

    #[test]
    fn structured_object_drops_unknown_fields() {
        let out = normalizer().normalize(
            "airlab/state",
            br#"{"co2": 800, "temp": 21.5, "unknown_field": "x"}"#,
        );
        assert_eq!(
            out,
            reading(&[
                (CanonicalMetric::Co2Ppm, 800.0),
                (CanonicalMetric::TemperatureC, 21.5)
            ])
        );
    }

    #[test]
    fn structured_and_scalar_shapes_parse_numbers_identically() {
        let expected = -369_739.877_037_096_77_f64;
        let structured = normalizer().normalize(
            "airlab/state",
            br#"{"co2": -369739.87703709677}"#,
        );
        let scalar = normalizer().normalize("airlab/sensor1/co2", b"-369739.87703709677");

        assert_eq!(structured.get(CanonicalMetric::Co2Ppm), Some(expected));
        assert_eq!(scalar.get(CanonicalMetric::Co2Ppm), Some(expected));
    }

    #[test]
    fn structured_object_coerces_numeric_strings_and_drops_the_rest() {
        let out = normalizer().normalize(
            "airlab/state",
            br#"{"rh": " 41.5 ", "voc": null, "nox": [1], "pressure": {"v": 1000}, "co2": "high"}"#,
        );
        assert_eq!(out, reading(&[(CanonicalMetric::HumidityPercent, 41.5)]));
    }

    #[test]
    fn structured_object_last_alias_wins() {
        let out = normalizer().normalize("airlab/state", br#"{"co2_ppm": 700, "co2": 900}"#);
        assert_eq!(out, reading(&[(CanonicalMetric::Co2Ppm, 900.0)]));
    }

    #[test]
    fn booleans_coerce_like_numbers() {
        let out = normalizer().normalize("airlab/state", br#"{"voc": true, "nox": false}"#);
        assert_eq!(
            out,
            reading(&[
                (CanonicalMetric::VocIndex, 1.0),
                (CanonicalMetric::NoxIndex, 0.0)
            ])
        );
    }

    #[test]
    fn scalar_rightmost_matching_segment_wins() {
        let out = normalizer().normalize("airlab/sensor1/co2", b"800");
        assert_eq!(out, reading(&[(CanonicalMetric::Co2Ppm, 800.0)]));

        let out = normalizer().normalize("airlab/temperature/rh", b"40");
        assert_eq!(out, reading(&[(CanonicalMetric::HumidityPercent, 40.0)]));
    }

    #[test]
    fn scalar_skips_unrecognized_trailing_segments() {
        let out = normalizer().normalize("airlab/co2/state", b"612");
        assert_eq!(out, reading(&[(CanonicalMetric::Co2Ppm, 612.0)]));
    }

    #[test]
    fn scalar_without_base_prefix_uses_whole_channel() {
        let out = normalizer().normalize("home/livingroom/temp", b" 19.25\n");
        assert_eq!(out, reading(&[(CanonicalMetric::TemperatureC, 19.25)]));
    }

    #[test]
    fn scalar_non_numeric_payload_is_empty() {
        let out = normalizer().normalize("airlab/co2", b"online");
        assert!(out.is_empty());
    }

    #[test]
    fn malformed_payload_on_unknown_channel_is_empty() {
        let n = normalizer();
        assert_eq!(
            n.classify("airlab/status", b"not-json{{{"),
            Normalized::Unrecognized
        );
        assert!(n.normalize("airlab/status", b"not-json{{{").is_empty());
    }

    #[test]
    fn json_object_without_known_fields_falls_through_to_scalar() {
        // The object parses but yields nothing, so the topic path is tried.
        let out = normalizer().normalize("airlab/co2", br#"{"uptime": 5}"#);
        assert!(out.is_empty());

        let out = normalizer().normalize("airlab/co2", b"[800]");
        assert!(out.is_empty());
    }

    #[test]
    fn json_scalar_payload_uses_channel() {
        let out = normalizer().normalize("airlab/pressure", b"1013.2");
        assert_eq!(out, reading(&[(CanonicalMetric::PressureHpa, 1013.2)]));
    }

    #[test]
    fn metadata_channels_are_ignored() {
        let n = normalizer();
        assert_eq!(
            n.classify("airlab/sensor/co2/config", br#"{"co2": 800}"#),
            Normalized::Metadata
        );
    }

    #[test]
    fn invalid_utf8_is_tolerated() {
        let out = normalizer().normalize("airlab/co2", &[0xff, 0xfe, b'8']);
        assert!(out.is_empty());
    }

    #[test]
    fn accepted_reports_shape() {
        let n = normalizer();
        match n.classify("airlab/x", br#"{"co2": 1}"#) {
            Normalized::Accepted { shape, .. } => assert_eq!(shape, "structured_object"),
            other => panic!("unexpected {other:?}"),
        }
        match n.classify("airlab/co2", b"1") {
            Normalized::Accepted { shape, .. } => assert_eq!(shape, "scalar_per_channel"),
            other => panic!("unexpected {other:?}"),
        }
    }

    struct CsvPairs;

    impl PayloadShape for CsvPairs {
        fn name(&self) -> &'static str {
            "csv_pairs"
        }

        fn parse(&self, _channel: &str, payload: &str) -> Option<Reading> {
            let mut reading = Reading::new();
            for pair in payload.split(',') {
                let (key, value) = pair.split_once('=')?;
                reading.insert(canonicalize(key)?, value.trim().parse().ok()?);
            }
            Some(reading)
        }
    }

    #[test]
    fn additional_shapes_plug_in_after_builtins() {
        let mut n = normalizer();
        n.push_shape(Box::new(CsvPairs));
        let out = n.normalize("airlab/state", b"co2=700,temp=20");
        assert_eq!(
            out,
            reading(&[
                (CanonicalMetric::Co2Ppm, 700.0),
                (CanonicalMetric::TemperatureC, 20.0)
            ])
        );
    }
}
