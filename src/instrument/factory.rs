//! Driver selection
//!
//! Rules are tried in order; the first whose predicate accepts the device
//! record builds its driver. Anything unmatched gets the generic driver.

use super::dispatcher::ScpiDispatcher;
use super::driver::{GenericDriver, InstrumentDriver, KeithleyDmm, TektronixScope};
use bench_shared::DeviceRecord;
use tracing::debug;

pub type Predicate = fn(&DeviceRecord) -> bool;
pub type Constructor = fn(DeviceRecord, ScpiDispatcher) -> Box<dyn InstrumentDriver>;

/// One `(predicate, constructor)` pair
#[derive(Clone, Copy)]
pub struct DriverRule {
    pub name: &'static str,
    pub matches: Predicate,
    pub build: Constructor,
}

pub struct DriverFactory {
    rules: Vec<DriverRule>,
}

impl Default for DriverFactory {
    fn default() -> Self {
        Self {
            rules: vec![
                DriverRule {
                    name: "tektronix-tds",
                    matches: |r| {
                        manufacturer_contains(r, "TEKTRONIX") && r.model.to_ascii_uppercase().contains("TDS")
                    },
                    build: |r, d| Box::new(TektronixScope::new(r, d)),
                },
                DriverRule {
                    name: "keithley",
                    matches: |r| manufacturer_contains(r, "KEITHLEY"),
                    build: |r, d| Box::new(KeithleyDmm::new(r, d)),
                },
            ],
        }
    }
}

impl DriverFactory {
    /// A factory that always builds the generic driver
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule after the existing ones
    pub fn with_rule(mut self, rule: DriverRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Name of the rule that would claim `record`
    pub fn rule_for(&self, record: &DeviceRecord) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| (rule.matches)(record))
            .map(|rule| rule.name)
    }

    pub fn create(&self, record: DeviceRecord, dispatcher: ScpiDispatcher) -> Box<dyn InstrumentDriver> {
        match self.rules.iter().find(|rule| (rule.matches)(&record)) {
            Some(rule) => {
                debug!("[DRIVER] Rule '{}' claims {}", rule.name, record.key);
                (rule.build)(record, dispatcher)
            }
            None => {
                debug!(
                    "[DRIVER] No rule for {} {} ({}), using generic driver",
                    record.manufacturer, record.model, record.key
                );
                Box::new(GenericDriver::new(record, dispatcher))
            }
        }
    }
}

fn manufacturer_contains(record: &DeviceRecord, needle: &str) -> bool {
    record.manufacturer.to_ascii_uppercase().contains(needle)
}
