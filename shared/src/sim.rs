//! In-process virtual SCPI instrument
//!
//! Answers `*IDN?`, honours `*RST`/`*CLS`, remembers every `HEADER value` it is
//! sent and returns it for `HEADER?`. A compound message (`A?;B 1;C?`) is
//! handled unit by unit and the query answers are joined with `;`. Header
//! matching ignores case and a leading `:`.

use crate::scpi::{self, FIELD_DELIMITER, QUERY_MARKER};
use std::collections::HashMap;
use tracing::debug;

/// Answer to the error queue query when nothing is pending
pub const NO_ERROR: &str = "+0,\"No error\"";

/// Answer for a header that was never set
pub const DEFAULT_VALUE: &str = "0";

#[derive(Debug, Clone)]
pub struct VirtualInstrument {
    identity: String,
    settings: HashMap<String, String>,
    presets: HashMap<String, String>,
    messages_handled: u64,
}

impl VirtualInstrument {
    /// Create an instrument that identifies as `identity`
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            settings: HashMap::new(),
            presets: HashMap::new(),
            messages_handled: 0,
        }
    }

    /// Instrument named after a `SIM::<name>` resource
    pub fn named(name: &str) -> Self {
        Self::new(format!("Bench Console,Virtual Instrument,SIM-{name},1.0"))
    }

    /// A value that survives `*RST`
    pub fn with_preset(mut self, header: &str, value: &str) -> Self {
        let header = normalize(header);
        self.settings.insert(header.clone(), value.to_string());
        self.presets.insert(header, value.to_string());
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn messages_handled(&self) -> u64 {
        self.messages_handled
    }

    /// Current value of a header, if set
    pub fn setting(&self, header: &str) -> Option<&str> {
        self.settings.get(&normalize(header)).map(String::as_str)
    }

    /// Handle one program message; `Some` when it contained at least one query
    pub fn handle(&mut self, message: &str) -> Option<String> {
        self.messages_handled += 1;
        let mut answers = Vec::new();

        for unit in message.split(FIELD_DELIMITER) {
            let unit = unit.trim();
            if unit.is_empty() {
                continue;
            }
            if scpi::is_query(unit) {
                answers.push(self.answer(unit));
            } else {
                self.apply(unit);
            }
        }

        if answers.is_empty() {
            None
        } else {
            Some(answers.join(&FIELD_DELIMITER.to_string()))
        }
    }

    fn answer(&self, unit: &str) -> String {
        // Query arguments (`MEAS:VOLT? DEF`) do not take part in matching
        let header = unit.split_whitespace().next().unwrap_or(unit);
        let header = normalize(header.trim_end_matches(QUERY_MARKER));
        match header.as_str() {
            "*IDN" => self.identity.clone(),
            "*OPC" => "1".to_string(),
            "SYST:ERR" | "SYSTEM:ERROR" => NO_ERROR.to_string(),
            _ => self
                .settings
                .get(&header)
                .cloned()
                .unwrap_or_else(|| DEFAULT_VALUE.to_string()),
        }
    }

    fn apply(&mut self, unit: &str) {
        if scpi::is_reset(unit) {
            debug!("[SIM] {} reset", self.identity);
            self.settings = self.presets.clone();
            return;
        }
        if unit.eq_ignore_ascii_case(scpi::CLEAR_STATUS) {
            return;
        }

        let (header, value) = match unit.split_once(char::is_whitespace) {
            Some((header, value)) => (header, value.trim()),
            None => (unit, ""),
        };
        self.settings.insert(normalize(header), value.to_string());
    }
}

fn normalize(header: &str) -> String {
    header.trim().trim_start_matches(':').to_ascii_uppercase()
}
