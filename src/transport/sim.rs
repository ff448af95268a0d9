//! In-process virtual instrument transport (`SIM::<name>::INSTR`)
//!
//! The instrument runs in its own task on the far end of a `tokio::io::duplex`
//! pipe, so the dispatcher above it sees an ordinary byte stream.

use crate::transport::traits::TransportStream;
use anyhow::Result;
use async_trait::async_trait;
use bench_shared::codec::{self, LineDecoder};
use bench_shared::sim::VirtualInstrument;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tracing::{debug, warn};

const PIPE_CAPACITY: usize = 64 * 1024;

#[async_trait]
impl TransportStream for DuplexStream {
    async fn shutdown(&mut self) -> Result<()> {
        AsyncWriteExt::shutdown(self).await?;
        Ok(())
    }
}

/// Start `instrument` in a task and return the client end of its pipe
pub fn spawn_virtual(instrument: VirtualInstrument) -> DuplexStream {
    let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(serve(server, instrument));
    client
}

/// A peer that reads everything and never answers
#[cfg(test)]
pub fn spawn_silent() -> DuplexStream {
    let (client, mut server) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok(n) = server.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });
    client
}

/// Answer program messages on `stream` until the peer hangs up
pub async fn serve<S>(mut stream: S, mut instrument: VirtualInstrument)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);

        loop {
            let line = match decoder.decode_next() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("[SIM] {} dropping input: {}", instrument.identity(), e);
                    decoder.clear();
                    break;
                }
            };
            debug!("[SIM] {} RECEIVED: {}", instrument.identity(), line);

            let Some(answer) = instrument.handle(&line) else {
                continue;
            };
            let frame = match codec::encode(&answer) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[SIM] {} cannot encode answer: {}", instrument.identity(), e);
                    continue;
                }
            };
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}
