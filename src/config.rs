//! Runtime configuration
//!
//! Every component takes a plain config struct with working defaults; `main`
//! fills them from the command line.

use bench_shared::{timing, topics};
use std::path::PathBuf;
use std::time::Duration;

pub const REPOSITORY_FILE: &str = "YAKETYYAK.json";
pub const INVENTORY_FILE: &str = "VISA_FLEET.json";
pub const RESPONSES_DIR: &str = "responses";

/// Timeouts of one instrument link
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bounded wait for a query response
    pub query_timeout: Duration,
    /// Bounded wait for a write to drain into the transport
    pub write_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_millis(timing::QUERY_TIMEOUT_MS),
            write_timeout: Duration::from_millis(timing::WRITE_TIMEOUT_MS),
        }
    }
}

/// Identification policy used while scanning
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Total identification attempts for interfaces that need warm-up
    pub attempts: u32,
    /// Fixed wait between attempts
    pub backoff: Duration,
    pub connect_timeout: Duration,
    /// Addresses probed at the same time
    pub concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: timing::PROBE_ATTEMPTS,
            backoff: Duration::from_millis(timing::PROBE_BACKOFF_MS),
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    pub probe: ProbeConfig,
    pub dispatch: DispatchConfig,
    /// Where answered queries are journaled; `None` disables the journal
    pub journal_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Prefix of the topics decoded outputs are published on
    pub output_prefix: String,
    /// Device key or address used when no device matches a trigger's model
    pub default_target: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_prefix: topics::OUTPUT_PREFIX.to_string(),
            default_target: None,
        }
    }
}

/// Configuration of the whole console
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub data_dir: PathBuf,
    /// Addresses probed by every scan
    pub candidates: Vec<String>,
    /// Periodic scan interval; `None` scans only on demand
    pub scan_interval: Option<Duration>,
    pub fleet: FleetConfig,
    pub pipeline: PipelineConfig,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("DATA");
        Self {
            fleet: FleetConfig {
                journal_dir: Some(data_dir.join(RESPONSES_DIR)),
                ..Default::default()
            },
            data_dir,
            candidates: Vec::new(),
            scan_interval: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ConsoleConfig {
    pub fn repository_path(&self) -> PathBuf {
        self.data_dir.join(REPOSITORY_FILE)
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.data_dir.join(INVENTORY_FILE)
    }

    /// Move every data file under `data_dir`
    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        if self.fleet.journal_dir.is_some() {
            self.fleet.journal_dir = Some(data_dir.join(RESPONSES_DIR));
        }
        self.data_dir = data_dir;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConsoleConfig::default();
        assert_eq!(config.fleet.dispatch.query_timeout, Duration::from_millis(5000));
        assert_eq!(config.fleet.probe.attempts, 2);
        assert_eq!(config.fleet.probe.backoff, Duration::from_secs(2));
        assert!(config.scan_interval.is_none());
        assert_eq!(config.pipeline.output_prefix, "OPEN-AIR/repository");
    }

    #[test]
    fn test_data_dir_moves_files() {
        let config = ConsoleConfig::default().with_data_dir(PathBuf::from("/tmp/bench"));
        assert_eq!(config.repository_path(), PathBuf::from("/tmp/bench/YAKETYYAK.json"));
        assert_eq!(config.inventory_path(), PathBuf::from("/tmp/bench/VISA_FLEET.json"));
        assert_eq!(
            config.fleet.journal_dir,
            Some(PathBuf::from("/tmp/bench/responses"))
        );
    }
}
