//! Bench Console shared types
//!
//! This crate provides the pieces of the instrument command engine that do not
//! need a runtime: the SCPI line codec, the per-link state machine, resource
//! address parsing, the command descriptor tree with its resolver, builder and
//! response parser, device records with the inventory knowledge base, atomic
//! JSON persistence and an in-process virtual instrument.

pub mod builder;
pub mod codec;
pub mod descriptor;
pub mod device;
pub mod persist;
pub mod resource;
pub mod response;
pub mod sim;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

pub use builder::build;
pub use descriptor::{CommandTree, FieldMap, LookupError, ResolvedCommand};
pub use device::{DeviceRecord, DeviceStatus, GroupedInventory, Identity};
pub use resource::{InterfaceClass, Resource, ResourceError};
pub use response::{ParseError, ParsedResponse};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters for instrument I/O
pub mod timing {
    /// Bounded wait for a query response
    pub const QUERY_TIMEOUT_MS: u64 = 5000;

    /// Bounded wait for a write to be accepted by the transport
    pub const WRITE_TIMEOUT_MS: u64 = 2000;

    /// Bounded wait for opening a connection
    pub const CONNECT_TIMEOUT_MS: u64 = 3000;

    /// Identification attempts for interfaces that need warm-up (USB/serial)
    pub const PROBE_ATTEMPTS: u32 = 2;

    /// Fixed backoff between identification attempts
    pub const PROBE_BACKOFF_MS: u64 = 2000;

    /// Default interval between periodic fleet scans (0 disables the timer)
    pub const SCAN_INTERVAL_SECS: u64 = 0;
}

/// SCPI wire conventions
pub mod scpi {
    /// Identification query
    pub const IDN_QUERY: &str = "*IDN?";

    /// Soft reset command, never followed by another reset
    pub const RESET_COMMAND: &str = "*RST";

    /// Clear status command
    pub const CLEAR_STATUS: &str = "*CLS";

    /// Marker that classifies a command as a query
    pub const QUERY_MARKER: char = '?';

    /// Delimiters of an unresolved placeholder
    pub const PLACEHOLDER_OPEN: char = '<';
    pub const PLACEHOLDER_CLOSE: char = '>';

    /// Separator between fields of a compound response
    pub const FIELD_DELIMITER: char = ';';

    /// True when the command expects a response
    pub fn is_query(command: &str) -> bool {
        command.contains(QUERY_MARKER)
    }

    /// True when the command still carries a placeholder delimiter
    pub fn has_unresolved_placeholder(command: &str) -> bool {
        command.contains(PLACEHOLDER_OPEN) || command.contains(PLACEHOLDER_CLOSE)
    }

    /// True for the reset command itself (compared case-insensitively)
    pub fn is_reset(command: &str) -> bool {
        command.trim().eq_ignore_ascii_case(RESET_COMMAND)
    }
}

/// Bus topic conventions
pub mod topics {
    /// Root of every topic on the bus
    pub const ROOT: &str = "OPEN-AIR";

    /// Prefix of repository descriptor topics
    pub const REPOSITORY_PREFIX: &str = "OPEN-AIR/repository/";

    /// Explicit repository save request
    pub const REPOSITORY_SAVE: &str = "OPEN-AIR/actions/yak/save/trigger";

    /// Whole-document repository replacement
    pub const REPOSITORY_REPLACE: &str = "OPEN-AIR/repository/yak/update";

    /// Fleet scan request
    pub const DISCOVERY_TRIGGER: &str = "OPEN-AIR/Device/Discovery/Search_Trigger";

    /// Grouped inventory publication
    pub const INVENTORY: &str = "OPEN-AIR/setup/devices";

    /// Prefix of per-device topics
    pub const DEVICE_PREFIX: &str = "OPEN-AIR/Device/";

    /// Default prefix under which decoded outputs are published
    pub const OUTPUT_PREFIX: &str = "OPEN-AIR/repository";

    /// Separator between path segments
    pub const SEPARATOR: char = '/';

    /// Action marker closing a trigger path
    pub const TRIGGER: &str = "trigger";

    pub fn device_topic(device_key: &str, leaf: &str) -> String {
        format!("{DEVICE_PREFIX}{device_key}/{leaf}")
    }

    /// Split a topic into path segments
    pub fn split(path: &str) -> Vec<String> {
        path.split(SEPARATOR).map(str::to_string).collect()
    }

    /// Join path segments into a topic
    pub fn join<S: AsRef<str>>(parts: &[S]) -> String {
        parts
            .iter()
            .map(|p| p.as_ref())
            .collect::<Vec<_>>()
            .join("/")
    }
}
