//! Positional decoding of compound SCPI responses
//!
//! A response such as `1.0E6;3.0E5;ON` is split on `;` and each trimmed field is
//! paired, in order, with the declared output names of the command.

use crate::descriptor::{FieldMap, SCPI_OUTPUTS};
use crate::scpi::FIELD_DELIMITER;
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{info, warn};

/// The one command whose declared outputs are known to be in the wrong order
pub const NAB_BANDWIDTH_TRIGGER_PATH: [&str; 7] = [
    "yak",
    "Bandwidth",
    "nab",
    "NAB_bandwidth_settings",
    "scpi_details",
    "generic_model",
    "trigger",
];

const NAB_SWEEP_TIME_KEY: &str = "Sweep_Time_s";
const NAB_CONTINUOUS_KEY: &str = "Continuous_Mode_On";
const NAB_SWAP: (usize, usize) = (3, 4);

/// Number of base path segments carried into an output topic
pub const OUTPUT_TOPIC_DEPTH: usize = 4;

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("Response has {received} fields, {expected} outputs declared")]
    LengthMismatch { expected: usize, received: usize },
}

/// Decoded response: output name -> field, in declared order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedResponse {
    pub fields: IndexMap<String, String>,
}

impl ParsedResponse {
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Pair every field with the topic it is published on
    pub fn topics<S: AsRef<str>>(&self, prefix: &str, path: &[S]) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|(key, value)| (output_topic(prefix, path, key), value.clone()))
            .collect()
    }
}

/// Decode `raw` against the declared `outputs` of the command at `path_parts`
pub fn parse<S: AsRef<str>>(
    path_parts: &[S],
    outputs: &FieldMap,
    raw: &str,
) -> Result<ParsedResponse, ParseError> {
    let values: Vec<String> = raw
        .split(FIELD_DELIMITER)
        .map(|field| field.trim().to_string())
        .collect();
    let mut keys: Vec<String> = outputs.keys().cloned().collect();

    if needs_nab_swap(path_parts, &keys) {
        let (a, b) = NAB_SWAP;
        info!(
            "[PARSE] Correcting NAB output order: swapping '{}' and '{}'",
            keys[a], keys[b]
        );
        keys.swap(a, b);
    }

    if keys.len() != values.len() {
        warn!(
            "[PARSE] Response length mismatch: {} outputs declared, {} fields received in '{}'",
            keys.len(),
            values.len(),
            raw
        );
        return Err(ParseError::LengthMismatch {
            expected: keys.len(),
            received: values.len(),
        });
    }

    Ok(ParsedResponse {
        fields: keys.into_iter().zip(values).collect(),
    })
}

fn needs_nab_swap<S: AsRef<str>>(path_parts: &[S], keys: &[String]) -> bool {
    let is_nab_path = path_parts.len() == NAB_BANDWIDTH_TRIGGER_PATH.len()
        && path_parts
            .iter()
            .zip(NAB_BANDWIDTH_TRIGGER_PATH)
            .all(|(part, expected)| part.as_ref() == expected);

    is_nab_path
        && keys.len() > NAB_SWAP.1
        && keys[NAB_SWAP.0].starts_with(NAB_SWEEP_TIME_KEY)
        && keys[NAB_SWAP.1].starts_with(NAB_CONTINUOUS_KEY)
}

/// `<prefix>/<p0>/<p1>/<p2>/<p3>/scpi_outputs/<key>/value`
///
/// Paths shorter than four segments contribute what they have.
pub fn output_topic<S: AsRef<str>>(prefix: &str, path: &[S], key: &str) -> String {
    let mut segments: Vec<&str> = Vec::with_capacity(OUTPUT_TOPIC_DEPTH + 4);
    let prefix = prefix.trim_end_matches('/');
    if !prefix.is_empty() {
        segments.push(prefix);
    }
    segments.extend(path.iter().take(OUTPUT_TOPIC_DEPTH).map(|p| p.as_ref()));
    segments.push(SCPI_OUTPUTS);
    segments.push(key);
    segments.push("value");
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn schema(names: &[&str]) -> FieldMap {
        names
            .iter()
            .map(|n| (n.to_string(), Value::Null))
            .collect()
    }

    #[test]
    fn test_positional_decode() {
        let parsed = parse(
            &["sa", "Marker", "get", "Peak", "scpi_details", "generic_model", "trigger"],
            &schema(&["X_Hz", "Y_dBm"]),
            " 1.0E6 ; -42.5\r",
        )
        .unwrap();

        assert_eq!(parsed.get("X_Hz"), Some("1.0E6"));
        assert_eq!(parsed.get("Y_dBm"), Some("-42.5"));
    }

    #[test]
    fn test_scenario_c_length_mismatch() {
        let err = parse(&["p"], &schema(&["a", "b", "c"]), "1;2").unwrap_err();
        assert_eq!(
            err,
            ParseError::LengthMismatch {
                expected: 3,
                received: 2
            }
        );
    }

    #[test]
    fn test_scenario_d_nab_swap() {
        let keys = [
            "RBW_Hz",
            "VBW_Hz",
            "Auto_RBW_On",
            "Sweep_Time_s",
            "Continuous_Mode_On",
        ];
        let parsed = parse(&NAB_BANDWIDTH_TRIGGER_PATH, &schema(&keys), "1E3;3E2;1;1;0.05").unwrap();

        let order: Vec<_> = parsed.fields.keys().cloned().collect();
        assert_eq!(
            order,
            vec!["RBW_Hz", "VBW_Hz", "Auto_RBW_On", "Continuous_Mode_On", "Sweep_Time_s"]
        );
        assert_eq!(parsed.get("Continuous_Mode_On"), Some("1"));
        assert_eq!(parsed.get("Sweep_Time_s"), Some("0.05"));
    }

    #[test]
    fn test_nab_swap_needs_exact_path() {
        let keys = ["a", "b", "c", "Sweep_Time_s", "Continuous_Mode_On"];
        let mut path = NAB_BANDWIDTH_TRIGGER_PATH.to_vec();
        path[5] = "N9340B";

        let parsed = parse(&path, &schema(&keys), "1;2;3;4;5").unwrap();
        assert_eq!(parsed.get("Sweep_Time_s"), Some("4"));
    }

    #[test]
    fn test_nab_swap_needs_matching_keys() {
        let keys = ["a", "b", "c", "Continuous_Mode_On", "Sweep_Time_s"];
        let parsed = parse(&NAB_BANDWIDTH_TRIGGER_PATH, &schema(&keys), "1;2;3;4;5").unwrap();
        assert_eq!(parsed.get("Continuous_Mode_On"), Some("4"));
    }

    #[test]
    fn test_output_topic() {
        let path = ["yak", "Frequency", "get", "Center", "scpi_details", "M1", "trigger"];
        assert_eq!(
            output_topic("OPEN-AIR/repository", &path, "Center_Hz"),
            "OPEN-AIR/repository/yak/Frequency/get/Center/scpi_outputs/Center_Hz/value"
        );
        assert_eq!(output_topic("", &["a", "b"], "k"), "a/b/scpi_outputs/k/value");
    }

    #[test]
    fn test_topics_follow_field_order() {
        let parsed = parse(&["a", "b", "c", "d"], &schema(&["x", "y"]), "1;2").unwrap();
        let topics = parsed.topics("root", &["a", "b", "c", "d"]);
        assert_eq!(topics[0].0, "root/a/b/c/d/scpi_outputs/x/value");
        assert_eq!(topics[1].1, "2");
    }
}
