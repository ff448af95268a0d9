pub mod serial;
pub mod sim;
pub mod tcp;
pub mod traits;
pub mod usbtmc;

pub use traits::{BoxedStream, TransportConnector, TransportStream};

use anyhow::Result;
use async_trait::async_trait;
use bench_shared::resource::Endpoint;
use bench_shared::sim::VirtualInstrument;
use bench_shared::Resource;
use tracing::debug;

/// Opens whatever interface a resource string names
#[derive(Debug, Default, Clone)]
pub struct ResourceConnector;

impl ResourceConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for ResourceConnector {
    async fn connect(&self, resource: &Resource) -> Result<BoxedStream> {
        debug!("[TRANSPORT] Opening {} ({})", resource, resource.interface());
        let stream: BoxedStream = match resource.endpoint() {
            Endpoint::Tcp { host, port } => Box::new(tcp::connect(host, *port).await?),
            Endpoint::Serial { path, baud } => Box::new(serial::open(path, *baud)?),
            Endpoint::Usb { device } => Box::new(usbtmc::open(device).await?),
            Endpoint::Virtual { name } => Box::new(sim::spawn_virtual(VirtualInstrument::named(name))),
        };
        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "VISA"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_routes_virtual_resource() {
        let connector = ResourceConnector::new();
        let resource = Resource::parse("SIM::dmm::INSTR").unwrap();
        let mut stream = connector.connect(&resource).await.unwrap();

        stream.write_all(b"*IDN?\n").await.unwrap();
        let mut buf = [0u8; 128];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().contains("SIM-dmm"));
    }

    #[tokio::test]
    async fn test_refused_tcp_is_an_error() {
        let connector = ResourceConnector::new();
        // Port 1 on loopback is essentially never listening
        let resource = Resource::parse("TCPIP::127.0.0.1::1::SOCKET").unwrap();
        assert!(connector.connect(&resource).await.is_err());
    }
}
