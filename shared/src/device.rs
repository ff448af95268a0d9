//! Device records, identity parsing and the instrument knowledge base

use crate::resource::{sanitize, InterfaceClass};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Placeholder for identity fields that could not be read
pub const UNKNOWN: &str = "Unknown";

pub const DEFAULT_DEVICE_TYPE: &str = "Unknown Instrument";
pub const DEFAULT_NOTES: &str = "Not in Knowledge Base";

/// Grouping fallbacks for records without a type or model
pub const UNKNOWN_TYPE: &str = "Unknown Type";
pub const UNKNOWN_MODEL: &str = "Unknown Model";

/// Model number -> (device type, notes)
const KNOWN_DEVICES: &[(&str, &str, &str)] = &[
    ("33220A", "Function Generator", "20 MHz Arbitrary Waveform"),
    ("33210A", "Function Generator", "10 MHz Arbitrary Waveform"),
    ("34401A", "Multimeter (DMM)", "6.5 Digit Benchtop Standard"),
    ("54641D", "Oscilloscope", "Mixed Signal (2 Ana + 16 Dig)"),
    ("DS1104Z", "Oscilloscope", "100 MHz, 4 Channel Digital"),
    ("66000A", "Power Mainframe", "Modular System (8 Slots)"),
    ("66101A", "DC Power Module", "8V / 16A (128W)"),
    ("66102A", "DC Power Module", "20V / 7.5A (150W)"),
    ("66103A", "DC Power Module", "35V / 4.5A (150W)"),
    ("66104A", "DC Power Module", "60V / 2.5A (150W)"),
    ("6060B", "Electronic Load", "DC Load (300 Watt)"),
    ("3235", "Switch Unit", "High-perf Switching Matrix"),
    ("3235A", "Switch Unit", "High-perf Switching Matrix"),
    ("N9340B", "Spectrum Analyzer", "Handheld (100 kHz - 3 GHz)"),
];

/// `{device_type: {model: [record, ...]}}`
pub type GroupedInventory = BTreeMap<String, BTreeMap<String, Vec<DeviceRecord>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Active,
    Unresponsive,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Active => write!(f, "Active"),
            DeviceStatus::Unresponsive => write!(f, "Unresponsive"),
        }
    }
}

/// Fields of an `*IDN?` answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware: String,
}

impl Identity {
    /// Split `manufacturer,model,serial,firmware`; missing fields are empty
    ///
    /// Extra fields beyond the fourth are ignored.
    pub fn parse(idn: &str) -> Self {
        if idn.trim().is_empty() {
            return Self {
                manufacturer: UNKNOWN.to_string(),
                model: UNKNOWN.to_string(),
                serial_number: String::new(),
                firmware: String::new(),
            };
        }

        let mut parts = idn.split(',').map(|p| p.trim().to_string());
        let mut next = || parts.next().unwrap_or_default();
        Self {
            manufacturer: next(),
            model: next(),
            serial_number: next(),
            firmware: next(),
        }
    }
}

/// One scanned instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Persistence key: serial number, else the sanitized address
    #[serde(default)]
    pub key: String,
    pub address: String,
    pub status: DeviceStatus,
    pub interface: InterfaceClass,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware: String,
    pub identification_string: String,
    pub device_type: String,
    pub notes: String,
}

impl DeviceRecord {
    /// Record for a device that answered the identification query
    pub fn active(address: &str, interface: InterfaceClass, idn: &str) -> Self {
        let identity = Identity::parse(idn);
        Self {
            key: device_key(&identity.serial_number, address),
            address: address.to_string(),
            status: DeviceStatus::Active,
            interface,
            manufacturer: identity.manufacturer,
            model: identity.model,
            serial_number: identity.serial_number,
            firmware: identity.firmware,
            identification_string: idn.to_string(),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            notes: DEFAULT_NOTES.to_string(),
        }
    }

    /// Record for a device that never answered
    pub fn unresponsive(address: &str, interface: InterfaceClass) -> Self {
        Self {
            key: sanitize(address),
            address: address.to_string(),
            status: DeviceStatus::Unresponsive,
            interface,
            manufacturer: UNKNOWN.to_string(),
            model: UNKNOWN.to_string(),
            serial_number: UNKNOWN.to_string(),
            firmware: UNKNOWN.to_string(),
            identification_string: String::new(),
            device_type: UNKNOWN.to_string(),
            notes: "Connection Timed Out".to_string(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }

    /// Matches a bus-side device key against the record's key or address
    pub fn answers_to(&self, key: &str) -> bool {
        self.key == key || self.address == key || sanitize(&self.address) == key
    }
}

/// Serial number when it identifies the unit, else derived from the address
pub fn device_key(serial_number: &str, address: &str) -> String {
    match serial_number {
        "" => sanitize(address),
        "0" => format!("{}_{}", serial_number, sanitize(address)),
        serial => serial.to_string(),
    }
}

/// Suffix repeated keys with `_1`, `_2`, ... in scan order
pub fn dedupe_keys(records: &mut [DeviceRecord]) {
    let mut seen = HashSet::new();
    for record in records.iter_mut() {
        let original = record.key.clone();
        let mut candidate = original.clone();
        let mut counter = 1;
        while !seen.insert(candidate.clone()) {
            candidate = format!("{original}_{counter}");
            counter += 1;
        }
        record.key = candidate;
    }
}

/// Knowledge-base entry for a model
pub fn lookup_model(model: &str) -> Option<(&'static str, &'static str)> {
    KNOWN_DEVICES
        .iter()
        .find(|(known, _, _)| *known == model)
        .map(|(_, device_type, notes)| (*device_type, *notes))
}

/// Attach device type and notes from the knowledge base
pub fn augment(mut record: DeviceRecord) -> DeviceRecord {
    let (device_type, notes) = lookup_model(&record.model).unwrap_or((DEFAULT_DEVICE_TYPE, DEFAULT_NOTES));
    record.device_type = device_type.to_string();
    record.notes = notes.to_string();
    record
}

pub fn group_by_type_and_model(records: &[DeviceRecord]) -> GroupedInventory {
    let mut grouped = GroupedInventory::new();
    for record in records {
        let device_type = non_empty_or(&record.device_type, UNKNOWN_TYPE);
        let model = non_empty_or(&record.model, UNKNOWN_MODEL);
        grouped
            .entry(device_type)
            .or_default()
            .entry(model)
            .or_default()
            .push(record.clone());
    }
    grouped
}

/// All records of a grouped inventory, in group order
pub fn flatten(grouped: &GroupedInventory) -> Vec<DeviceRecord> {
    grouped
        .values()
        .flat_map(|models| models.values())
        .flatten()
        .cloned()
        .collect()
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
