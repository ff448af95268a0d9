//! USBTMC character-device transport (`USB<n>::/dev/usbtmc<n>::INSTR`)
//!
//! The Linux `usbtmc` driver exposes each instrument as a device file: a write
//! sends one program message, a read returns the pending response.

use crate::transport::traits::TransportStream;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};

#[async_trait]
impl TransportStream for File {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::flush(self).await?;
        Ok(())
    }
}

/// Open the device file for reading and writing
pub async fn open(device: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .await
        .with_context(|| format!("opening USBTMC device {device}"))
}
