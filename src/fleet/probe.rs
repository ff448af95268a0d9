//! Identification of one candidate address

use crate::config::{DispatchConfig, ProbeConfig};
use crate::instrument::ScpiDispatcher;
use crate::transport::TransportConnector;
use bench_shared::resource::clean_for_display;
use bench_shared::{scpi, DeviceRecord, InterfaceClass, Resource};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Result of probing one address
pub struct ProbeOutcome {
    pub record: DeviceRecord,
    /// Open link of an identified device, handed on to its driver
    pub dispatcher: Option<ScpiDispatcher>,
}

impl ProbeOutcome {
    fn unresponsive(address: &str, interface: InterfaceClass) -> Self {
        Self {
            record: DeviceRecord::unresponsive(address, interface),
            dispatcher: None,
        }
    }
}

/// Attempts allowed for an interface class
pub fn attempts_for(interface: InterfaceClass, config: &ProbeConfig) -> u32 {
    if interface.needs_warmup() {
        config.attempts.max(1)
    } else {
        1
    }
}

pub async fn probe(
    connector: &dyn TransportConnector,
    address: &str,
    config: &ProbeConfig,
    dispatch: &DispatchConfig,
) -> ProbeOutcome {
    let resource = match Resource::parse(address) {
        Ok(resource) => resource,
        Err(e) => {
            warn!("[FLEET] Cannot probe '{}': {}", address, e);
            return ProbeOutcome::unresponsive(address, InterfaceClass::Unknown);
        }
    };
    let interface = resource.interface();
    let attempts = attempts_for(interface, config);

    for attempt in 1..=attempts {
        if attempt > 1 {
            info!(
                "[FLEET] Retrying {} in {:?} (attempt {}/{})",
                resource, config.backoff, attempt, attempts
            );
            sleep(config.backoff).await;
        }

        match identify(connector, &resource, config, dispatch).await {
            Ok((idn, dispatcher)) => {
                info!("[FLEET] {} identified as '{}'", resource, idn);
                return ProbeOutcome {
                    record: DeviceRecord::active(resource.address(), interface, &idn),
                    dispatcher: Some(dispatcher),
                };
            }
            Err(reason) => warn!("[FLEET] {} attempt {}: {}", resource, attempt, reason),
        }
    }

    warn!("[FLEET] {} unresponsive", resource);
    ProbeOutcome::unresponsive(resource.address(), interface)
}

async fn identify(
    connector: &dyn TransportConnector,
    resource: &Resource,
    config: &ProbeConfig,
    dispatch: &DispatchConfig,
) -> Result<(String, ScpiDispatcher), String> {
    let stream = match timeout(config.connect_timeout, connector.connect(resource)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(format!("connect failed: {e:#}")),
        Err(_) => return Err(format!("connect timed out after {:?}", config.connect_timeout)),
    };

    let mut dispatcher = ScpiDispatcher::new(resource.address(), stream, dispatch.clone());
    let result = dispatcher.try_query(scpi::IDN_QUERY).await;
    match result.map(|raw| clean_for_display(&raw)) {
        Ok(idn) if !idn.is_empty() => {
            debug!("[FLEET] {} raw identity '{}'", resource, idn);
            Ok((idn, dispatcher))
        }
        Ok(_) => {
            dispatcher.close().await;
            Err("empty identification".to_string())
        }
        Err(e) => {
            dispatcher.close().await;
            Err(e.to_string())
        }
    }
}
