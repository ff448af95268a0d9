//! One client connection to the served instrument

use anyhow::Result;
use bench_shared::codec::{self, LineDecoder};
use bench_shared::sim::VirtualInstrument;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Every session talks to the same instrument, like clients of one bench device
pub type SharedInstrument = Arc<Mutex<VirtualInstrument>>;

pub struct InstrumentSession {
    addr: SocketAddr,
    stream: TcpStream,
    instrument: SharedInstrument,
    decoder: LineDecoder,
    read_buf: Vec<u8>,
}

impl InstrumentSession {
    pub fn new(stream: TcpStream, addr: SocketAddr, instrument: SharedInstrument) -> Self {
        Self {
            addr,
            stream,
            instrument,
            decoder: LineDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Serve program messages until the client hangs up
    pub async fn run(mut self) -> Result<()> {
        info!("[SIM] Client connected: {}", self.addr);
        let _ = self.stream.set_nodelay(true);

        loop {
            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                info!("[SIM] Client disconnected: {}", self.addr);
                return Ok(());
            }
            self.decoder.extend(&self.read_buf[..n]);

            loop {
                let message = match self.decoder.decode_next() {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[SIM] {} sent an unreadable message: {}", self.addr, e);
                        self.decoder.clear();
                        break;
                    }
                };
                debug!("[SIM] {} RECEIVED: {}", self.addr, message);

                let answer = self.instrument.lock().await.handle(&message);
                if let Some(answer) = answer {
                    debug!("[SIM] {} SENT: {}", self.addr, answer);
                    self.stream.write_all(&codec::encode(&answer)?).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_sessions_share_instrument_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let instrument: SharedInstrument =
            Arc::new(Mutex::new(VirtualInstrument::new("ACME,VX1,SN1,1.0")));

        let served = Arc::clone(&instrument);
        tokio::spawn(async move {
            loop {
                let (stream, addr) = listener.accept().await.unwrap();
                tokio::spawn(InstrumentSession::new(stream, addr, Arc::clone(&served)).run());
            }
        });

        let mut first = TcpStream::connect(local).await.unwrap();
        first.write_all(b"VOLT 3.3\n*OPC?\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = first.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"1\n");

        let mut second = TcpStream::connect(local).await.unwrap();
        second.write_all(b"VOLT?\n").await.unwrap();
        let n = second.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"3.3\n");

        assert_eq!(instrument.lock().await.setting("VOLT"), Some("3.3"));
    }
}
