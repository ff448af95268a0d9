//! Per-device command worker
//!
//! Each identified device gets one task that owns its driver and drains an
//! unbounded FIFO. Commands run strictly in submission order, one at a time.

use crate::events::FleetEvent;
use crate::instrument::{DispatchError, InstrumentDriver};
use crate::inventory::{JournalEntry, ResponseJournal};
use bench_shared::now_ms;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type CommandResult = Result<Option<String>, DispatchError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Raw SCPI text
    Raw { command: String, is_query: bool },
    /// Named driver procedure
    Procedure {
        name: String,
        argument: Option<String>,
    },
}

/// A command waiting in a device queue
#[derive(Debug)]
pub struct QueuedCommand {
    pub request: Request,
    pub correlation_id: String,
    pub enqueued_at: u64,
    pub reply: Option<oneshot::Sender<CommandResult>>,
}

impl QueuedCommand {
    pub fn raw(command: impl Into<String>, is_query: bool, correlation_id: impl Into<String>) -> Self {
        Self::new(
            Request::Raw {
                command: command.into(),
                is_query,
            },
            correlation_id,
        )
    }

    pub fn procedure(
        name: impl Into<String>,
        argument: Option<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::new(
            Request::Procedure {
                name: name.into(),
                argument,
            },
            correlation_id,
        )
    }

    fn new(request: Request, correlation_id: impl Into<String>) -> Self {
        Self {
            request,
            correlation_id: correlation_id.into(),
            enqueued_at: now_ms(),
            reply: None,
        }
    }

    /// Deliver the result on `reply` as well as on the event channel
    pub fn with_reply(mut self, reply: oneshot::Sender<CommandResult>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Text used for the command in events
    pub fn describe(&self) -> String {
        match &self.request {
            Request::Raw { command, .. } => command.clone(),
            Request::Procedure {
                name,
                argument: Some(argument),
            } => format!("{name}({argument})"),
            Request::Procedure { name, .. } => format!("{name}()"),
        }
    }
}

pub struct Worker {
    driver: Box<dyn InstrumentDriver>,
    queue: mpsc::UnboundedReceiver<QueuedCommand>,
    events: mpsc::UnboundedSender<FleetEvent>,
    journal: Option<ResponseJournal>,
}

impl Worker {
    /// Start the worker task; dropping the returned sender stops it once the queue drains
    pub fn spawn(
        driver: Box<dyn InstrumentDriver>,
        events: mpsc::UnboundedSender<FleetEvent>,
        journal: Option<ResponseJournal>,
    ) -> (mpsc::UnboundedSender<QueuedCommand>, JoinHandle<()>) {
        let (tx, queue) = mpsc::unbounded_channel();
        let worker = Self {
            driver,
            queue,
            events,
            journal,
        };
        (tx, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        let key = self.driver.record().key.clone();
        info!("[WORKER] {} started ({} driver)", key, self.driver.kind());

        while let Some(job) = self.queue.recv().await {
            let waited = now_ms().saturating_sub(job.enqueued_at);
            debug!(
                "[WORKER] {} executing '{}' (queued {} ms)",
                key,
                job.describe(),
                waited
            );

            let result = match &job.request {
                Request::Raw { command, is_query } => {
                    self.driver.send_command(command, *is_query).await
                }
                Request::Procedure { name, argument } => {
                    self.driver.procedure(name, argument.as_deref()).await
                }
            };
            self.report(&job, &result);

            if let Some(reply) = job.reply {
                // The submitter may have stopped waiting
                let _ = reply.send(result);
            }
        }

        self.driver.close().await;
        let record = self.driver.record();
        let _ = self.events.send(FleetEvent::Status {
            key: record.key.clone(),
            address: record.address.clone(),
            status: "Disconnected".to_string(),
        });
        info!("[WORKER] {} stopped", key);
    }

    fn report(&self, job: &QueuedCommand, result: &CommandResult) {
        let record = self.driver.record();
        let command = job.describe();

        match result {
            Ok(Some(response)) => {
                let _ = self.events.send(FleetEvent::Response {
                    key: record.key.clone(),
                    address: record.address.clone(),
                    command: command.clone(),
                    response: response.clone(),
                    correlation_id: job.correlation_id.clone(),
                });
                if let Some(journal) = &self.journal {
                    let entry = JournalEntry::now(
                        &record.serial_number,
                        &command,
                        response,
                        &job.correlation_id,
                    );
                    if let Err(e) = journal.record(&record.key, &entry) {
                        warn!("[WORKER] {} journal write failed: {}", record.key, e);
                    }
                }
            }
            Ok(None) => debug!("[WORKER] {} '{}' done", record.key, command),
            Err(e) => {
                error!("[WORKER] {} '{}' failed: {}", record.key, command, e);
                let _ = self.events.send(FleetEvent::Error {
                    key: record.key.clone(),
                    address: record.address.clone(),
                    message: e.to_string(),
                    command,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::instrument::driver::GenericDriver;
    use crate::instrument::ScpiDispatcher;
    use crate::transport::sim::spawn_virtual;
    use bench_shared::sim::VirtualInstrument;
    use bench_shared::{DeviceRecord, InterfaceClass};

    fn driver() -> Box<dyn InstrumentDriver> {
        let idn = "ACME,VX1,SN7,1.0";
        let record = DeviceRecord::active("SIM::w::INSTR", InterfaceClass::Virtual, idn);
        let dispatcher = ScpiDispatcher::new(
            "SIM::w::INSTR",
            Box::new(spawn_virtual(VirtualInstrument::new(idn))),
            DispatchConfig::default(),
        );
        Box::new(GenericDriver::new(record, dispatcher))
    }

    #[tokio::test]
    async fn test_fifo_order_and_events() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (queue, handle) = Worker::spawn(driver(), events_tx, None);

        queue.send(QueuedCommand::raw("VOLT 1", false, "a")).unwrap();
        queue.send(QueuedCommand::raw("VOLT 2", false, "b")).unwrap();
        let (tx, rx) = oneshot::channel();
        queue
            .send(QueuedCommand::raw("VOLT?", true, "c").with_reply(tx))
            .unwrap();

        assert_eq!(rx.await.unwrap(), Ok(Some("2".to_string())));
        match events.recv().await.unwrap() {
            FleetEvent::Response {
                key,
                response,
                correlation_id,
                ..
            } => {
                assert_eq!(key, "SN7");
                assert_eq!(response, "2");
                assert_eq!(correlation_id, "c");
            }
            other => panic!("unexpected event {other:?}"),
        }

        drop(queue);
        handle.await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(FleetEvent::Status { status, .. }) if status == "Disconnected"
        ));
    }

    #[tokio::test]
    async fn test_failure_becomes_error_event() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (queue, _handle) = Worker::spawn(driver(), events_tx, None);

        let (tx, rx) = oneshot::channel();
        queue
            .send(QueuedCommand::raw("FREQ <f>", false, "x").with_reply(tx))
            .unwrap();

        assert!(matches!(
            rx.await.unwrap(),
            Err(DispatchError::UnresolvedPlaceholder(_))
        ));
        match events.recv().await.unwrap() {
            FleetEvent::Error { command, .. } => assert_eq!(command, "FREQ <f>"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_answered_queries_are_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let journal = ResponseJournal::new(dir.path());
        let (queue, _handle) = Worker::spawn(driver(), events_tx, Some(journal));

        let (tx, rx) = oneshot::channel();
        queue
            .send(QueuedCommand::raw("*IDN?", true, "j").with_reply(tx))
            .unwrap();
        rx.await.unwrap().unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("SN7_query_"));
    }

    #[test]
    fn test_describe() {
        assert_eq!(QueuedCommand::raw("*IDN?", true, "1").describe(), "*IDN?");
        assert_eq!(
            QueuedCommand::procedure("waveform", Some("2".into()), "1").describe(),
            "waveform(2)"
        );
    }
}
