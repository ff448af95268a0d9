//! SCPI dispatcher for one instrument link
//!
//! Owns the link's stream, its line decoder and its state machine. Every
//! command is checked for leftover placeholders before anything is sent; any
//! I/O failure or timeout triggers one soft reset (`*RST`) unless the failed
//! command was the reset itself.

use crate::config::DispatchConfig;
use crate::transport::BoxedStream;
use bench_shared::codec::{self, CodecError, LineDecoder};
use bench_shared::scpi;
use bench_shared::state_machine::{LinkEvent, LinkState, LinkStateMachine, TransitionResult};
use futures::FutureExt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Upper bound on reads spent draining stale input before one command
const MAX_DISCARD_READS: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Unresolved placeholder in command '{0}'")]
    UnresolvedPlaceholder(String),

    #[error("Instrument link is not connected")]
    NotConnected,

    #[error("Instrument link is busy")]
    Busy,

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Unsupported procedure '{0}'")]
    Unsupported(String),
}

impl DispatchError {
    /// Failures that went through the transport and call for a soft reset
    pub fn is_io_failure(&self) -> bool {
        matches!(self, DispatchError::Transport(_) | DispatchError::Timeout(_))
    }
}

pub struct ScpiDispatcher {
    address: String,
    stream: Option<BoxedStream>,
    decoder: LineDecoder,
    link: LinkStateMachine,
    config: DispatchConfig,
    read_buf: Vec<u8>,
}

impl ScpiDispatcher {
    /// Wrap an already opened stream
    pub fn new(address: impl Into<String>, stream: BoxedStream, config: DispatchConfig) -> Self {
        let mut link = LinkStateMachine::new();
        link.process_event(LinkEvent::Opened);
        Self {
            address: address.into(),
            stream: Some(stream),
            decoder: LineDecoder::new(),
            link,
            config,
            read_buf: vec![0u8; 4096],
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && self.link.is_connected()
    }

    pub fn commands_completed(&self) -> u64 {
        self.link.commands_completed()
    }

    /// Send a command that expects no response
    pub async fn try_write(&mut self, command: &str) -> Result<(), DispatchError> {
        reject_placeholders(command)?;
        self.begin()?;
        self.discard_pending();
        let result = self.transmit(command).await;
        self.finish(command, result).await
    }

    /// Send a query and wait for its response line
    pub async fn try_query(&mut self, command: &str) -> Result<String, DispatchError> {
        reject_placeholders(command)?;
        self.begin()?;
        self.discard_pending();
        let result = match self.transmit(command).await {
            Ok(()) => self.receive().await,
            Err(e) => Err(e),
        };
        self.finish(command, result).await
    }

    /// `true` when the command was transmitted
    pub async fn write_safe(&mut self, command: &str) -> bool {
        match self.try_write(command).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[DISPATCH] {} write '{}' failed: {}", self.address, command, e);
                false
            }
        }
    }

    /// The response line, or `None` on any failure
    pub async fn query_safe(&mut self, command: &str) -> Option<String> {
        match self.try_query(command).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("[DISPATCH] {} query '{}' failed: {}", self.address, command, e);
                None
            }
        }
    }

    /// Route on the query marker
    pub async fn send(&mut self, command: &str) -> Result<Option<String>, DispatchError> {
        if scpi::is_query(command) {
            self.try_query(command).await.map(Some)
        } else {
            self.try_write(command).await.map(|_| None)
        }
    }

    /// Close the link; later commands fail with `NotConnected`
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("[DISPATCH] {} shutdown: {}", self.address, e);
            }
        }
        self.link.process_event(LinkEvent::Closed);
        info!("[DISPATCH] {} closed", self.address);
    }

    fn begin(&mut self) -> Result<(), DispatchError> {
        if self.stream.is_none() {
            return Err(DispatchError::NotConnected);
        }
        match self.link.process_event(LinkEvent::CommandStarted) {
            TransitionResult::Success(_) => Ok(()),
            TransitionResult::Invalid {
                from: LinkState::Busy,
                ..
            } => Err(DispatchError::Busy),
            TransitionResult::Invalid { .. } => Err(DispatchError::NotConnected),
        }
    }

    async fn finish<T>(
        &mut self,
        command: &str,
        result: Result<T, DispatchError>,
    ) -> Result<T, DispatchError> {
        let err = match result {
            Ok(value) => {
                self.link.process_event(LinkEvent::CommandFinished);
                return Ok(value);
            }
            Err(e) => e,
        };

        if err.is_io_failure() {
            if scpi::is_reset(command) {
                error!(
                    "[DISPATCH] {} reset failed: {} (not retried)",
                    self.address, err
                );
            } else {
                self.soft_reset().await;
            }
        }

        match err {
            // The stream is gone; drop it
            DispatchError::Transport(_) => {
                self.link.process_event(LinkEvent::Failed);
                self.stream = None;
            }
            _ => {
                self.decoder.clear();
                self.link.process_event(LinkEvent::CommandFinished);
            }
        }
        Err(err)
    }

    async fn soft_reset(&mut self) {
        warn!("[DISPATCH] {} sending soft reset after failure", self.address);
        match self.transmit(scpi::RESET_COMMAND).await {
            Ok(()) => {
                info!("[DISPATCH] {} soft reset sent", self.address);
                self.discard_pending();
            }
            Err(e) => error!(
                "[DISPATCH] {} soft reset failed: {} (not retried)",
                self.address, e
            ),
        }
    }

    /// Drop whatever the instrument already sent, such as a late answer to a
    /// query that timed out, so the next read starts on a fresh response
    fn discard_pending(&mut self) {
        self.decoder.clear();
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut discarded = 0;
        for _ in 0..MAX_DISCARD_READS {
            match stream.read(&mut self.read_buf).now_or_never() {
                Some(Ok(n)) if n > 0 => discarded += n,
                _ => break,
            }
        }
        if discarded > 0 {
            warn!(
                "[DISPATCH] {} discarded {} stale byte(s) before sending",
                self.address, discarded
            );
        }
    }

    async fn transmit(&mut self, command: &str) -> Result<(), DispatchError> {
        let stream = self.stream.as_mut().ok_or(DispatchError::NotConnected)?;
        let frame = codec::encode(command)?;
        debug!("[DISPATCH] {} SENT: {}", self.address, command);

        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };
        match timeout(self.config.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DispatchError::Transport(e.to_string())),
            Err(_) => Err(DispatchError::Timeout(self.config.write_timeout)),
        }
    }

    async fn receive(&mut self) -> Result<String, DispatchError> {
        let Self {
            address,
            stream,
            decoder,
            read_buf,
            config,
            ..
        } = self;
        let stream = stream.as_mut().ok_or(DispatchError::NotConnected)?;

        let line = match timeout(config.query_timeout, read_line(stream, decoder, read_buf)).await {
            Ok(result) => result?,
            Err(_) => {
                decoder.clear();
                return Err(DispatchError::Timeout(config.query_timeout));
            }
        };
        debug!("[DISPATCH] {} RECEIVED: {}", address, line);
        Ok(line)
    }
}

async fn read_line(
    stream: &mut BoxedStream,
    decoder: &mut LineDecoder,
    buf: &mut [u8],
) -> Result<String, DispatchError> {
    loop {
        if let Some(line) = decoder.decode_next()? {
            return Ok(line);
        }
        let n = stream
            .read(buf)
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(DispatchError::Transport(
                "connection closed by instrument".to_string(),
            ));
        }
        decoder.extend(&buf[..n]);
    }
}

fn reject_placeholders(command: &str) -> Result<(), DispatchError> {
    if scpi::has_unresolved_placeholder(command) {
        warn!("[DISPATCH] Refusing to send '{}': unresolved placeholder", command);
        return Err(DispatchError::UnresolvedPlaceholder(command.to_string()));
    }
    Ok(())
}
