//! Placeholder substitution into command templates
//!
//! Every `<name>` whose `name` is an input key is replaced by the input's value.
//! The reserved names [`PATH_START`] and [`PATH_TERMINATOR`] are legacy wire
//! delimiters and always become a literal `"`, whatever value they carry.
//! Placeholders without an input are left untouched for the dispatcher to reject.

use crate::descriptor::FieldMap;
use serde_json::Value;

pub const PATH_START: &str = "path_start";
pub const PATH_TERMINATOR: &str = "path_terminator";

const QUOTE: &str = "\"";

/// Fill `template` from `inputs`
pub fn build(template: &str, inputs: &FieldMap) -> String {
    inputs
        .iter()
        .fold(template.to_string(), |command, (name, value)| {
            let placeholder = format!("<{name}>");
            if !command.contains(&placeholder) {
                return command;
            }
            let replacement = if name == PATH_START || name == PATH_TERMINATOR {
                QUOTE.to_string()
            } else {
                stringify(value)
            };
            command.replace(&placeholder, &replacement)
        })
}

/// Render an input value the way it goes on the wire
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scpi;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_scenario_a() {
        let built = build("FREQ <f> HZ", &inputs(&[("f", json!("1000"))]));
        assert_eq!(built, "FREQ 1000 HZ");
        assert!(!scpi::has_unresolved_placeholder(&built));
    }

    #[test]
    fn test_every_occurrence_replaced() {
        let built = build(":CALC:MARK<n>:X <x>;:CALC:MARK<n>:STAT ON", &inputs(&[
            ("n", json!(2)),
            ("x", json!(1.5e6)),
        ]));
        assert_eq!(built, ":CALC:MARK2:X 1500000.0;:CALC:MARK2:STAT ON");
    }

    #[test]
    fn test_reserved_names_become_quotes() {
        let built = build(
            ":MMEM:LOAD:STAT <path_start><file><path_terminator>",
            &inputs(&[
                ("path_start", json!("ignored")),
                ("file", json!("C:\\PRESETS\\A.STA")),
                ("path_terminator", Value::Null),
            ]),
        );
        assert_eq!(built, ":MMEM:LOAD:STAT \"C:\\PRESETS\\A.STA\"");
    }

    #[test]
    fn test_unknown_placeholder_left_in_place() {
        let built = build("BAND <rbw>", &FieldMap::new());
        assert_eq!(built, "BAND <rbw>");
        assert!(scpi::has_unresolved_placeholder(&built));
    }

    #[test]
    fn test_stringify_scalars() {
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&json!(42)), "42");
        assert_eq!(stringify(&Value::Null), "");
        assert_eq!(stringify(&json!("ON")), "ON");
    }
}
