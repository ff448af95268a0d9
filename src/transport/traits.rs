//! Seams between the dispatcher and the physical interfaces it drives

use anyhow::Result;
use async_trait::async_trait;
use bench_shared::Resource;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream to one instrument
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Flush and release the link
    async fn shutdown(&mut self) -> Result<()>;
}

/// An open link to one instrument
pub type BoxedStream = Box<dyn TransportStream>;

/// Opens links for resource addresses
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Attempt to open `resource`, returning a stream on success
    async fn connect(&self, resource: &Resource) -> Result<BoxedStream>;

    fn name(&self) -> &'static str;
}
