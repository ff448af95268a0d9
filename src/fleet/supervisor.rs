//! Fleet supervisor: scans candidate addresses and routes commands to device workers

use super::probe::{probe, ProbeOutcome};
use super::worker::{QueuedCommand, Worker};
use crate::config::FleetConfig;
use crate::events::FleetEvent;
use crate::instrument::{DispatchError, DriverFactory};
use crate::inventory::ResponseJournal;
use crate::transport::TransportConnector;
use bench_shared::device::{augment, dedupe_keys};
use bench_shared::resource::clean_for_display;
use bench_shared::DeviceRecord;
use futures::stream::{self, StreamExt};
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),
    #[error("Device '{0}' is not connected")]
    NotConnected(String),
    #[error("Command queue of '{0}' is closed")]
    QueueClosed(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

struct DeviceHandle {
    record: DeviceRecord,
    /// Present only for identified devices
    queue: Option<mpsc::UnboundedSender<QueuedCommand>>,
    worker: Option<JoinHandle<()>>,
}

pub struct FleetSupervisor {
    connector: Arc<dyn TransportConnector>,
    factory: DriverFactory,
    config: FleetConfig,
    /// Current scan's devices keyed by device key, in scan order
    devices: RwLock<IndexMap<String, DeviceHandle>>,
    events: mpsc::UnboundedSender<FleetEvent>,
    scan_lock: Mutex<()>,
}

impl FleetSupervisor {
    /// Create a supervisor and the receiver for everything it reports
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        factory: DriverFactory,
        config: FleetConfig,
    ) -> (Self, mpsc::UnboundedReceiver<FleetEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            connector,
            factory,
            config,
            devices: RwLock::new(IndexMap::new()),
            events,
            scan_lock: Mutex::new(()),
        };
        (supervisor, rx)
    }

    /// Probe every candidate and replace the fleet with the result
    ///
    /// Returns one record per distinct address, in candidate order. Workers
    /// of the previous scan finish their queues and close before probing.
    pub async fn scan(&self, candidates: &[String]) -> Vec<DeviceRecord> {
        let _scanning = self.scan_lock.lock().await;

        let addresses: IndexSet<String> = candidates
            .iter()
            .map(|address| clean_for_display(address))
            .filter(|address| !address.is_empty())
            .collect();
        info!("[FLEET] Scanning {} address(es) via {}", addresses.len(), self.connector.name());

        self.retire_all().await;

        let outcomes: Vec<ProbeOutcome> = stream::iter(addresses)
            .map(|address| {
                let connector = Arc::clone(&self.connector);
                let scan_config = self.config.probe.clone();
                let dispatch = self.config.dispatch.clone();
                async move { probe(connector.as_ref(), &address, &scan_config, &dispatch).await }
            })
            .buffered(self.config.probe.concurrency.max(1))
            .collect()
            .await;

        let (mut records, dispatchers): (Vec<_>, Vec<_>) = outcomes
            .into_iter()
            .map(|outcome| (outcome.record, outcome.dispatcher))
            .unzip();
        dedupe_keys(&mut records);
        let records: Vec<DeviceRecord> = records.into_iter().map(augment).collect();

        let journal = self.config.journal_dir.as_ref().map(ResponseJournal::new);
        let mut devices = IndexMap::with_capacity(records.len());
        for (record, dispatcher) in records.iter().zip(dispatchers) {
            let (queue, worker) = match dispatcher {
                Some(dispatcher) => {
                    let driver = self.factory.create(record.clone(), dispatcher);
                    let (queue, worker) = Worker::spawn(driver, self.events.clone(), journal.clone());
                    (Some(queue), Some(worker))
                }
                None => (None, None),
            };
            self.emit(FleetEvent::Status {
                key: record.key.clone(),
                address: record.address.clone(),
                status: record.status.to_string(),
            });
            devices.insert(
                record.key.clone(),
                DeviceHandle {
                    record: record.clone(),
                    queue,
                    worker,
                },
            );
        }

        let active = records.iter().filter(|r| r.is_active()).count();
        info!(
            "[FLEET] Scan complete: {} active, {} unresponsive",
            active,
            records.len() - active
        );

        *self.devices.write().await = devices;
        self.emit(FleetEvent::Inventory(records.clone()));
        records
    }

    /// Records of the last scan, in scan order
    pub async fn records(&self) -> Vec<DeviceRecord> {
        let devices = self.devices.read().await;
        devices.values().map(|handle| handle.record.clone()).collect()
    }

    /// Record answering to a device key or address
    pub async fn find(&self, target: &str) -> Option<DeviceRecord> {
        let devices = self.devices.read().await;
        find_handle(&devices, target).map(|handle| handle.record.clone())
    }

    /// First connected device whose model matches, ignoring case
    pub async fn find_by_model(&self, model: &str) -> Option<DeviceRecord> {
        let devices = self.devices.read().await;
        devices
            .values()
            .filter(|handle| handle.queue.is_some())
            .find(|handle| handle.record.model.eq_ignore_ascii_case(model))
            .map(|handle| handle.record.clone())
    }

    pub async fn first_active(&self) -> Option<DeviceRecord> {
        let devices = self.devices.read().await;
        devices
            .values()
            .find(|handle| handle.queue.is_some())
            .map(|handle| handle.record.clone())
    }

    /// Queue `job` on the device answering to `target` without waiting for it
    ///
    /// An unknown or unconnected target is reported as an error event and
    /// returned immediately.
    pub async fn enqueue(&self, target: &str, job: QueuedCommand) -> Result<(), FleetError> {
        let devices = self.devices.read().await;
        let Some(handle) = find_handle(&devices, target) else {
            error!("[FLEET] Command '{}' for unknown device '{}'", job.describe(), target);
            self.emit(FleetEvent::Error {
                key: target.to_string(),
                address: target.to_string(),
                message: format!("Unknown device '{target}'"),
                command: job.describe(),
            });
            return Err(FleetError::UnknownDevice(target.to_string()));
        };

        let record = &handle.record;
        let Some(queue) = &handle.queue else {
            warn!("[FLEET] Command '{}' for unresponsive {}", job.describe(), record.key);
            self.emit(FleetEvent::Error {
                key: record.key.clone(),
                address: record.address.clone(),
                message: format!("Device '{}' is not connected", record.key),
                command: job.describe(),
            });
            return Err(FleetError::NotConnected(record.key.clone()));
        };

        debug!("[FLEET] Queued '{}' for {}", job.describe(), record.key);
        queue
            .send(job)
            .map_err(|_| FleetError::QueueClosed(record.key.clone()))
    }

    /// Queue a raw command
    pub async fn enqueue_command(
        &self,
        target: &str,
        command: &str,
        is_query: bool,
        correlation_id: &str,
    ) -> Result<(), FleetError> {
        self.enqueue(target, QueuedCommand::raw(command, is_query, correlation_id))
            .await
    }

    /// Queue a raw command and wait for its result
    pub async fn execute(
        &self,
        target: &str,
        command: &str,
        is_query: bool,
        correlation_id: &str,
    ) -> Result<Option<String>, FleetError> {
        let job = QueuedCommand::raw(command, is_query, correlation_id);
        self.submit(target, job).await
    }

    /// Queue a driver procedure and wait for its result
    pub async fn run_procedure(
        &self,
        target: &str,
        name: &str,
        argument: Option<String>,
        correlation_id: &str,
    ) -> Result<Option<String>, FleetError> {
        let job = QueuedCommand::procedure(name, argument, correlation_id);
        self.submit(target, job).await
    }

    /// Close every worker and forget the fleet
    pub async fn shutdown(&self) {
        let _scanning = self.scan_lock.lock().await;
        self.retire_all().await;
        info!("[FLEET] Shut down");
    }

    async fn submit(&self, target: &str, job: QueuedCommand) -> Result<Option<String>, FleetError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(target, job.with_reply(tx)).await?;
        let result = rx
            .await
            .map_err(|_| FleetError::QueueClosed(target.to_string()))?;
        Ok(result?)
    }

    async fn retire_all(&self) {
        let retired: Vec<DeviceHandle> = {
            let mut devices = self.devices.write().await;
            devices.drain(..).map(|(_, handle)| handle).collect()
        };
        for handle in retired {
            drop(handle.queue);
            if let Some(worker) = handle.worker {
                if let Err(e) = worker.await {
                    warn!("[FLEET] Worker of {} ended abnormally: {}", handle.record.key, e);
                }
            }
        }
    }

    fn emit(&self, event: FleetEvent) {
        if self.events.send(event).is_err() {
            debug!("[FLEET] No event listener");
        }
    }
}

fn find_handle<'a>(
    devices: &'a IndexMap<String, DeviceHandle>,
    target: &str,
) -> Option<&'a DeviceHandle> {
    devices
        .get(target)
        .or_else(|| devices.values().find(|handle| handle.record.answers_to(target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{spawn_silent, spawn_virtual};
    use crate::transport::{BoxedStream, ResourceConnector};
    use async_trait::async_trait;
    use bench_shared::resource::Endpoint;
    use bench_shared::sim::VirtualInstrument;
    use bench_shared::{DeviceStatus, Resource};

    /// Virtual instruments, except names starting with `silent` never answer
    struct Bench;

    #[async_trait]
    impl TransportConnector for Bench {
        async fn connect(&self, resource: &Resource) -> anyhow::Result<BoxedStream> {
            match resource.endpoint() {
                Endpoint::Virtual { name } if name.starts_with("silent") => {
                    Ok(Box::new(spawn_silent()))
                }
                Endpoint::Virtual { name } => {
                    Ok(Box::new(spawn_virtual(VirtualInstrument::named(name))))
                }
                other => Err(anyhow::anyhow!("not on the bench: {other:?}")),
            }
        }

        fn name(&self) -> &'static str {
            "bench"
        }
    }

    fn supervisor(connector: Arc<dyn TransportConnector>) -> (FleetSupervisor, mpsc::UnboundedReceiver<FleetEvent>) {
        FleetSupervisor::new(connector, DriverFactory::default(), FleetConfig::default())
    }

    fn addresses(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_unknown_device_reports_error() {
        let (fleet, mut events) = supervisor(Arc::new(Bench));

        let result = fleet.enqueue_command("NOPE", "*IDN?", true, "c-1").await;

        assert_eq!(result, Err(FleetError::UnknownDevice("NOPE".into())));
        match events.try_recv().unwrap() {
            FleetEvent::Error { key, command, .. } => {
                assert_eq!(key, "NOPE");
                assert_eq!(command, "*IDN?");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_reports_every_address() {
        let (fleet, mut events) = supervisor(Arc::new(Bench));

        let records = fleet
            .scan(&addresses(&["SIM::ok::INSTR", "SIM::silent::INSTR"]))
            .await;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, DeviceStatus::Active);
        assert_eq!(records[0].serial_number, "SIM-ok");
        assert_eq!(records[1].status, DeviceStatus::Unresponsive);
        assert_eq!(records[1].model, "Unknown");

        let mut saw_inventory = false;
        while let Ok(event) = events.try_recv() {
            if let FleetEvent::Inventory(inventory) = event {
                assert_eq!(inventory, records);
                saw_inventory = true;
            }
        }
        assert!(saw_inventory);

        assert!(matches!(
            fleet.execute("SIM::silent::INSTR", "*IDN?", true, "c").await,
            Err(FleetError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_runs_on_spawned_task() {
        let (fleet, _events) = supervisor(Arc::new(ResourceConnector::new()));
        let fleet = Arc::new(fleet);

        let records = tokio::spawn({
            let fleet = Arc::clone(&fleet);
            async move { fleet.scan(&addresses(&["SIM::bg::INSTR"])).await }
        })
        .await
        .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeviceStatus::Active);
        assert!(fleet.find("SIM::bg::INSTR").await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_addresses_probe_once() {
        let (fleet, _events) = supervisor(Arc::new(ResourceConnector::new()));

        let records = fleet
            .scan(&addresses(&["SIM::a::INSTR", " SIM::a::INSTR ", "SIM::b::INSTR", ""]))
            .await;

        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["SIM-a", "SIM-b"]);
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        let (fleet, _events) = supervisor(Arc::new(ResourceConnector::new()));
        fleet.scan(&addresses(&["SIM::psu::INSTR"])).await;

        for volts in 1..=5 {
            fleet
                .enqueue_command("SIM-psu", &format!("VOLT {volts}"), false, "w")
                .await
                .unwrap();
        }
        let last = fleet.execute("SIM::psu::INSTR", "VOLT?", true, "q").await;

        assert_eq!(last, Ok(Some("5".to_string())));
    }

    #[tokio::test]
    async fn test_procedure_routing() {
        let (fleet, _events) = supervisor(Arc::new(ResourceConnector::new()));
        fleet.scan(&addresses(&["SIM::gen::INSTR"])).await;

        let result = fleet.run_procedure("SIM-gen", "autoset", None, "p").await;

        assert_eq!(
            result,
            Err(FleetError::Dispatch(DispatchError::Unsupported("autoset".into())))
        );
    }

    #[tokio::test]
    async fn test_rescan_replaces_fleet() {
        let (fleet, mut events) = supervisor(Arc::new(ResourceConnector::new()));
        fleet.scan(&addresses(&["SIM::a::INSTR"])).await;
        fleet.scan(&addresses(&["SIM::b::INSTR"])).await;

        assert!(fleet.find("SIM-a").await.is_none());
        assert!(fleet.find("SIM-b").await.is_some());
        assert_eq!(
            fleet.find_by_model("virtual instrument").await.map(|r| r.key),
            Some("SIM-b".to_string())
        );

        let mut disconnected = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FleetEvent::Status { key, status, .. } = event {
                if status == "Disconnected" {
                    disconnected.push(key);
                }
            }
        }
        assert_eq!(disconnected, vec!["SIM-a".to_string()]);

        fleet.shutdown().await;
        assert!(fleet.records().await.is_empty());
    }
}
