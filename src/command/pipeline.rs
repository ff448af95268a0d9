//! Event router: inbound bus messages in, outbound bus messages out
//!
//! A single task reads inbound events in arrival order. Repository triggers
//! are resolved, built and queued on a device from that task, so commands
//! reach each device in trigger order; waiting for the answer and decoding it
//! happens in a spawned task.

use super::repository::CommandRepository;
use crate::config::PipelineConfig;
use crate::events::{inventory_event, FleetEvent, InboundEvent, OutboundEvent};
use crate::fleet::worker::CommandResult;
use crate::fleet::{FleetError, FleetSupervisor, QueuedCommand};
use crate::inventory::InventoryStore;
use bench_shared::descriptor::model_key_of;
use bench_shared::response::{self, ParseError};
use bench_shared::{build, now_ms, scpi, topics, FieldMap, LookupError};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const TX_INBOX: &str = "Tx_Inbox";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Resolution miss: {0}")]
    Resolve(#[from] LookupError),
    #[error("No device to run the command for model '{0}'")]
    NoTarget(String),
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Device worker dropped the command")]
    Dropped,
}

/// Body of a `Tx_Inbox` message
#[derive(Debug, Deserialize)]
struct InboxMessage {
    command: Option<String>,
    query: Option<bool>,
    procedure: Option<String>,
    argument: Option<Value>,
    #[serde(default = "default_correlation_id")]
    correlation_id: String,
}

fn default_correlation_id() -> String {
    "N/A".to_string()
}

/// A trigger whose command is queued on a device
pub struct PendingTrigger {
    path: Vec<String>,
    target: String,
    command: String,
    outputs: Option<FieldMap>,
    reply: oneshot::Receiver<CommandResult>,
}

impl PendingTrigger {
    /// Wait for the device and decode its answer into `(topic, value)` events
    pub async fn complete(self, output_prefix: &str) -> Result<Vec<OutboundEvent>, PipelineError> {
        let result = self.reply.await.map_err(|_| PipelineError::Dropped)?;
        let raw = result.map_err(FleetError::from)?;

        let (Some(outputs), Some(raw)) = (self.outputs, raw) else {
            debug!("[YAK] '{}' on {} expects no results", self.command, self.target);
            return Ok(Vec::new());
        };

        let parsed = response::parse(&self.path, &outputs, &raw)?;
        Ok(parsed
            .topics(output_prefix, &self.path)
            .into_iter()
            .map(|(topic, value)| OutboundEvent::new(topic, Value::String(value)))
            .collect())
    }
}

#[derive(Clone)]
pub struct Router {
    repository: Arc<CommandRepository>,
    fleet: Arc<FleetSupervisor>,
    inventory: InventoryStore,
    config: PipelineConfig,
    candidates: Arc<Vec<String>>,
    scanning: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
}

impl Router {
    pub fn new(
        repository: Arc<CommandRepository>,
        fleet: Arc<FleetSupervisor>,
        inventory: InventoryStore,
        config: PipelineConfig,
        candidates: Vec<String>,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let router = Self {
            repository,
            fleet,
            inventory,
            config,
            candidates: Arc::new(candidates),
            scanning: Arc::new(AtomicBool::new(false)),
            outbound,
        };
        (router, rx)
    }

    /// Route events until the inbound side closes
    ///
    /// With a `scan_interval` the candidate addresses are rescanned on that
    /// period, starting immediately.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundEvent>,
        mut fleet_events: mpsc::UnboundedReceiver<FleetEvent>,
        scan_interval: Option<Duration>,
    ) {
        let mut ticker = scan_interval.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        info!("[ROUTER] Started");

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                Some(event) = fleet_events.recv() => self.handle_fleet_event(event),
                _ = next_tick(&mut ticker) => {
                    self.start_scan();
                }
            }
        }

        info!("[ROUTER] Inbound closed, stopping");
        self.fleet.shutdown().await;
        while let Ok(event) = fleet_events.try_recv() {
            self.handle_fleet_event(event);
        }
    }

    /// Handle one inbound bus message
    pub async fn handle(&self, event: InboundEvent) {
        let topic = event.topic.as_str();

        if topic == topics::REPOSITORY_SAVE {
            if truthy(&event.payload) {
                match self.repository.save().await {
                    Ok(()) => info!("[YAK] Repository saved on request"),
                    Err(e) => error!("[YAK] Save failed: {}", e),
                }
            }
        } else if topic == topics::REPOSITORY_REPLACE {
            self.replace_repository(&event.payload).await;
        } else if topic.starts_with(topics::REPOSITORY_PREFIX) {
            if topic.to_ascii_lowercase().contains(topics::TRIGGER) && event.is_true() {
                self.trigger(topic).await;
            }
            if let Err(e) = self.repository.ingest_topic(topic, &event.payload).await {
                warn!("[YAK] Not stored '{}': {}", topic, e);
            }
        } else if topic == topics::DISCOVERY_TRIGGER {
            if event.is_true() {
                self.start_scan();
            }
        } else if let Some(key) = inbox_key(topic) {
            self.inbox(key, &event.payload).await;
        } else {
            debug!("[ROUTER] Ignoring '{}'", topic);
        }
    }

    /// Resolve, build and queue the command a trigger topic names
    pub async fn dispatch_trigger(&self, topic: &str) -> Result<PendingTrigger, PipelineError> {
        let relative = topic.strip_prefix(topics::REPOSITORY_PREFIX).unwrap_or(topic);
        let path = topics::split(relative);
        let model_key = model_key_of(&path).unwrap_or_default().to_string();

        let resolved = self.repository.resolve(&path, &model_key).await?;
        let command = build(&resolved.template, &resolved.inputs);
        let target = self.pick_target(&model_key).await?;
        info!("[YAK] '{}' -> {} as '{}'", relative, target, command);

        let (tx, reply) = oneshot::channel();
        let correlation_id = format!("yak-{}", now_ms());
        let job = QueuedCommand::raw(&command, scpi::is_query(&command), correlation_id);
        self.fleet.enqueue(&target, job.with_reply(tx)).await?;

        Ok(PendingTrigger {
            path,
            target,
            command,
            outputs: resolved.outputs,
            reply,
        })
    }

    /// React to something the fleet reported
    pub fn handle_fleet_event(&self, event: FleetEvent) {
        match event {
            FleetEvent::Inventory(records) => match self.inventory.save(&records) {
                Ok(grouped) => self.publish(inventory_event(&grouped)),
                Err(e) => error!("[INVENTORY] Save failed: {}", e),
            },
            other => self.publish(other.to_outbound()),
        }
    }

    /// Scan the configured candidates in the background
    ///
    /// Returns `false` without starting anything while a scan started here is
    /// still running.
    pub fn start_scan(&self) -> bool {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("[ROUTER] Scan already running, skipping");
            return false;
        }
        let fleet = Arc::clone(&self.fleet);
        let candidates = Arc::clone(&self.candidates);
        let scanning = Arc::clone(&self.scanning);
        tokio::spawn(async move {
            fleet.scan(&candidates).await;
            scanning.store(false, Ordering::SeqCst);
        });
        true
    }

    async fn trigger(&self, topic: &str) {
        let pending = match self.dispatch_trigger(topic).await {
            Ok(pending) => pending,
            Err(PipelineError::Resolve(e)) => {
                warn!("[YAK] Resolution miss for '{}': {}", topic, e);
                return;
            }
            Err(e) => {
                error!("[YAK] Trigger '{}' not dispatched: {}", topic, e);
                return;
            }
        };

        let prefix = self.config.output_prefix.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let command = pending.command.clone();
            match pending.complete(&prefix).await {
                Ok(events) => {
                    for event in events {
                        let _ = outbound.send(event);
                    }
                }
                Err(e) => warn!("[YAK] '{}' produced no results: {}", command, e),
            }
        });
    }

    /// Device for a trigger: model match, then the configured default, then any active device
    async fn pick_target(&self, model_key: &str) -> Result<String, PipelineError> {
        if let Some(record) = self.fleet.find_by_model(model_key).await {
            return Ok(record.key);
        }
        if let Some(target) = &self.config.default_target {
            return Ok(target.clone());
        }
        if let Some(record) = self.fleet.first_active().await {
            return Ok(record.key);
        }
        Err(PipelineError::NoTarget(model_key.to_string()))
    }

    async fn inbox(&self, key: &str, payload: &Value) {
        let message: InboxMessage = match serde_json::from_value(payload.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!("[ROUTER] Malformed {} message for {}: {}", TX_INBOX, key, e);
                return;
            }
        };

        let job = match (message.procedure, message.command) {
            (Some(name), _) => {
                let argument = message.argument.as_ref().map(bench_shared::builder::stringify);
                QueuedCommand::procedure(name, argument, message.correlation_id)
            }
            (None, Some(command)) => {
                let is_query = message.query.unwrap_or_else(|| scpi::is_query(&command));
                QueuedCommand::raw(command, is_query, message.correlation_id)
            }
            (None, None) => {
                warn!("[ROUTER] {} message for {} has no command", TX_INBOX, key);
                return;
            }
        };

        // Failures are already reported as error events
        let _ = self.fleet.enqueue(key, job).await;
    }

    async fn replace_repository(&self, payload: &Value) {
        let document = match payload.get("value").unwrap_or(payload) {
            Value::String(text) => match serde_json::from_str(text) {
                Ok(document) => document,
                Err(e) => {
                    warn!("[YAK] Replacement is not a JSON document: {}", e);
                    return;
                }
            },
            other => other.clone(),
        };
        if let Err(e) = self.repository.replace(document).await {
            error!("[YAK] Replacement rejected: {}", e);
        }
    }

    fn publish(&self, event: OutboundEvent) {
        if self.outbound.send(event).is_err() {
            debug!("[ROUTER] No outbound listener");
        }
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// `OPEN-AIR/Device/<key>/Tx_Inbox` -> `<key>`
fn inbox_key(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(topics::DEVICE_PREFIX)?
        .strip_suffix(TX_INBOX)?
        .strip_suffix(topics::SEPARATOR)
        .filter(|key| !key.is_empty())
}

/// Save requests accept `true` or `"true"`, bare or under `value`
fn truthy(payload: &Value) -> bool {
    match payload.get("value").unwrap_or(payload) {
        Value::Bool(flag) => *flag,
        Value::String(text) => text.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::instrument::DriverFactory;
    use crate::transport::ResourceConnector;
    use serde_json::json;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        router: Router,
        outbound: mpsc::UnboundedReceiver<OutboundEvent>,
        fleet_events: mpsc::UnboundedReceiver<FleetEvent>,
        repository: Arc<CommandRepository>,
        _dir: tempfile::TempDir,
    }

    async fn harness(devices: &[&str]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(CommandRepository::load(dir.path().join("YAKETYYAK.json")));
        let (fleet, fleet_events) = FleetSupervisor::new(
            Arc::new(ResourceConnector::new()),
            DriverFactory::default(),
            FleetConfig::default(),
        );
        let fleet = Arc::new(fleet);
        let candidates: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
        fleet.scan(&candidates).await;

        let (router, outbound) = Router::new(
            Arc::clone(&repository),
            fleet,
            InventoryStore::new(dir.path().join("VISA_FLEET.json")),
            PipelineConfig::default(),
            candidates,
        );
        Harness {
            router,
            outbound,
            fleet_events,
            repository,
            _dir: dir,
        }
    }

    async fn describe(repository: &CommandRepository, base: &[&str], template: &str, outputs: &[&str]) {
        let outputs: serde_json::Map<String, Value> = outputs
            .iter()
            .map(|name| (name.to_string(), json!({ "value": "" })))
            .collect();
        let node = json!({
            "scpi_details": { "generic_model": { "command_template": template } },
            "scpi_inputs": {
                "start": { "value": 100 },
                "stop": { "value": 200 },
            },
            "scpi_outputs": outputs,
        });
        repository.ingest(base, node).await.unwrap();
    }

    fn trigger_topic(base: &[&str]) -> String {
        format!(
            "{}{}/scpi_details/generic_model/trigger",
            topics::REPOSITORY_PREFIX,
            base.join("/")
        )
    }

    #[tokio::test]
    async fn test_overlapping_scan_requests_are_skipped() {
        let mut h = harness(&["SIM::sa::INSTR"]).await;
        while h.fleet_events.try_recv().is_ok() {}

        assert!(h.router.start_scan());
        assert!(!h.router.start_scan());

        loop {
            match timeout(WAIT, h.fleet_events.recv()).await.unwrap() {
                Some(FleetEvent::Inventory(records)) => {
                    assert_eq!(records.len(), 1);
                    break;
                }
                Some(_) => continue,
                None => panic!("fleet events closed"),
            }
        }
        timeout(WAIT, async {
            while h.router.scanning.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(h.router.start_scan());
    }

    #[tokio::test]
    async fn test_trigger_publishes_decoded_outputs() {
        let mut h = harness(&["SIM::sa::INSTR"]).await;
        let base = ["yak", "Frequency", "span", "range"];
        describe(
            &h.repository,
            &base,
            "FREQ:STAR <start>;FREQ:STOP <stop>;FREQ:STAR?;FREQ:STOP?",
            &["Start_Hz", "Stop_Hz"],
        )
        .await;

        h.router
            .handle(InboundEvent::new(trigger_topic(&base), json!({ "value": true })))
            .await;

        let first = timeout(WAIT, h.outbound.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, h.outbound.recv()).await.unwrap().unwrap();
        assert_eq!(
            first.topic,
            "OPEN-AIR/repository/yak/Frequency/span/range/scpi_outputs/Start_Hz/value"
        );
        assert_eq!(first.payload, json!("100"));
        assert_eq!(second.payload, json!("200"));

        // The trigger value itself is stored as well
        let mut stored = base.to_vec();
        stored.extend(["scpi_details", "generic_model", "trigger"]);
        assert_eq!(h.repository.lookup(&stored).await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_nab_bandwidth_order_is_corrected() {
        let h = harness(&["SIM::nab::INSTR"]).await;
        let base = ["yak", "Bandwidth", "nab", "NAB_bandwidth_settings"];
        describe(
            &h.repository,
            &base,
            "SWE:TIME 0.5;INIT:CONT 1;BAND:RES 3;BAND:VID 1;AVER:COUN 4;\
             BAND:RES?;BAND:VID?;AVER:COUN?;INIT:CONT?;SWE:TIME?",
            &["RBW_Hz", "VBW_Hz", "Average_Count", "Sweep_Time_s", "Continuous_Mode_On"],
        )
        .await;

        let pending = h.router.dispatch_trigger(&trigger_topic(&base)).await.unwrap();
        let events = pending.complete("OPEN-AIR/repository").await.unwrap();

        let value_of = |key: &str| {
            events
                .iter()
                .find(|e| e.topic.contains(&format!("/{key}/")))
                .map(|e| e.payload.clone())
        };
        assert_eq!(value_of("Continuous_Mode_On"), Some(json!("1")));
        assert_eq!(value_of("Sweep_Time_s"), Some(json!("0.5")));
        assert_eq!(value_of("RBW_Hz"), Some(json!("3")));
    }

    #[tokio::test]
    async fn test_length_mismatch_publishes_nothing() {
        let h = harness(&["SIM::sa::INSTR"]).await;
        let base = ["yak", "Marker", "peak", "read"];
        describe(&h.repository, &base, "FREQ:STAR?;FREQ:STOP?", &["a", "b", "c"]).await;

        let pending = h.router.dispatch_trigger(&trigger_topic(&base)).await.unwrap();

        assert!(matches!(
            pending.complete("OPEN-AIR/repository").await,
            Err(PipelineError::Parse(ParseError::LengthMismatch {
                expected: 3,
                received: 2
            }))
        ));
    }

    #[tokio::test]
    async fn test_resolution_miss_sends_nothing() {
        let h = harness(&["SIM::sa::INSTR"]).await;

        let result = h
            .router
            .dispatch_trigger(&trigger_topic(&["yak", "No", "Such", "thing"]))
            .await;

        assert!(matches!(result, Err(PipelineError::Resolve(_))));
    }

    #[tokio::test]
    async fn test_trigger_without_devices_has_no_target() {
        let h = harness(&[]).await;
        let base = ["yak", "Frequency", "span", "range"];
        describe(&h.repository, &base, "FREQ:STAR?", &["a"]).await;

        let result = h.router.dispatch_trigger(&trigger_topic(&base)).await;

        assert!(matches!(result, Err(PipelineError::NoTarget(model)) if model == "generic_model"));
    }

    #[tokio::test]
    async fn test_non_boolean_trigger_only_stores() {
        let mut h = harness(&["SIM::sa::INSTR"]).await;
        let base = ["yak", "Frequency", "span", "range"];
        describe(&h.repository, &base, "FREQ:STAR?", &["a"]).await;
        let topic = trigger_topic(&base);

        h.router
            .handle(InboundEvent::new(&topic, json!({ "value": "true" })))
            .await;

        let mut stored = base.to_vec();
        stored.extend(["scpi_details", "generic_model", "trigger"]);
        assert_eq!(h.repository.lookup(&stored).await.unwrap(), json!("true"));
        assert!(timeout(Duration::from_millis(200), h.outbound.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_inbox_command_and_procedure() {
        let mut h = harness(&["SIM::dmm::INSTR"]).await;

        h.router
            .handle(InboundEvent::new(
                "OPEN-AIR/Device/SIM-dmm/Tx_Inbox",
                json!({ "command": "*IDN?", "query": true, "correlation_id": "c-9" }),
            ))
            .await;
        h.router
            .handle(InboundEvent::new(
                "OPEN-AIR/Device/SIM-dmm/Tx_Inbox",
                json!({ "procedure": "measure_resistance" }),
            ))
            .await;

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let event = timeout(WAIT, h.fleet_events.recv()).await.unwrap().unwrap();
            match event {
                FleetEvent::Response { .. } | FleetEvent::Error { .. } => seen.push(event),
                _ => {}
            }
        }

        let rx = seen[0].to_outbound();
        assert_eq!(rx.topic, "OPEN-AIR/Device/SIM-dmm/Rx_Outbox");
        assert_eq!(rx.payload["response"], "Bench Console,Virtual Instrument,SIM-dmm,1.0");
        assert_eq!(rx.payload["correlation_id"], "c-9");
        // The virtual instrument gets the generic driver, which has no procedures
        assert_eq!(seen[1].to_outbound().topic, "OPEN-AIR/Device/SIM-dmm/Error");
    }

    #[tokio::test]
    async fn test_unknown_inbox_target_reports_error() {
        let mut h = harness(&[]).await;

        h.router
            .handle(InboundEvent::new(
                "OPEN-AIR/Device/GHOST/Tx_Inbox",
                json!({ "command": "*RST" }),
            ))
            .await;

        let key = loop {
            match h.fleet_events.try_recv().unwrap() {
                FleetEvent::Error { key, .. } => break key,
                _ => continue,
            }
        };
        assert_eq!(key, "GHOST");
    }

    #[tokio::test]
    async fn test_inventory_event_is_saved_and_published() {
        let mut h = harness(&["SIM::a::INSTR"]).await;

        let inventory = loop {
            match h.fleet_events.try_recv().unwrap() {
                FleetEvent::Inventory(records) => break records,
                _ => continue,
            }
        };
        h.router.handle_fleet_event(FleetEvent::Inventory(inventory));

        let published = h.outbound.try_recv().unwrap();
        assert_eq!(published.topic, topics::INVENTORY);
        assert_eq!(
            published.payload["Unknown Instrument"]["Virtual Instrument"][0]["serial_number"],
            "SIM-a"
        );
        assert_eq!(h.router.inventory.load_records().len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_replace_topics() {
        let h = harness(&[]).await;

        h.router
            .handle(InboundEvent::new(
                topics::REPOSITORY_REPLACE,
                json!({ "value": "{\"yak\": {\"x\": 1}}" }),
            ))
            .await;
        h.router
            .handle(InboundEvent::new(topics::REPOSITORY_SAVE, json!({ "value": "TRUE" })))
            .await;

        assert_eq!(h.repository.snapshot().await, json!({ "yak": { "x": 1 } }));
        let reloaded = CommandRepository::load(h.repository.path());
        assert_eq!(reloaded.snapshot().await, json!({ "yak": { "x": 1 } }));
    }

    #[test]
    fn test_inbox_key() {
        assert_eq!(inbox_key("OPEN-AIR/Device/MY1/Tx_Inbox"), Some("MY1"));
        assert_eq!(inbox_key("OPEN-AIR/Device//Tx_Inbox"), None);
        assert_eq!(inbox_key("OPEN-AIR/Device/MY1/Rx_Outbox"), None);
    }

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!({ "value": true })));
        assert!(truthy(&json!("True")));
        assert!(!truthy(&json!({ "value": 1 })));
    }
}
