//! Instrument drivers
//!
//! Every driver wraps one [`ScpiDispatcher`] and the record of the device it
//! talks to. The shared surface is `identify`/`reset`/`send_command`; vendor
//! drivers add named procedures reachable through [`InstrumentDriver::procedure`].

use super::dispatcher::{DispatchError, ScpiDispatcher};
use async_trait::async_trait;
use bench_shared::{scpi, DeviceRecord};
use tracing::{debug, info};

#[async_trait]
pub trait InstrumentDriver: Send {
    /// Short driver name for logs
    fn kind(&self) -> &'static str;

    fn record(&self) -> &DeviceRecord;

    fn dispatcher(&mut self) -> &mut ScpiDispatcher;

    /// Names accepted by [`InstrumentDriver::procedure`]
    fn procedures(&self) -> &'static [&'static str] {
        &[]
    }

    async fn identify(&mut self) -> Result<String, DispatchError> {
        self.dispatcher().try_query(scpi::IDN_QUERY).await
    }

    async fn reset(&mut self) -> Result<(), DispatchError> {
        self.dispatcher().try_write(scpi::RESET_COMMAND).await
    }

    /// Raw command; `Some(response)` for queries
    async fn send_command(
        &mut self,
        command: &str,
        is_query: bool,
    ) -> Result<Option<String>, DispatchError> {
        if is_query {
            self.dispatcher().try_query(command).await.map(Some)
        } else {
            self.dispatcher().try_write(command).await.map(|_| None)
        }
    }

    /// Run a named vendor procedure
    async fn procedure(
        &mut self,
        name: &str,
        _argument: Option<&str>,
    ) -> Result<Option<String>, DispatchError> {
        Err(DispatchError::Unsupported(name.to_string()))
    }

    async fn close(&mut self) {
        self.dispatcher().close().await;
    }
}

/// Plain SCPI device
pub struct GenericDriver {
    record: DeviceRecord,
    dispatcher: ScpiDispatcher,
}

impl GenericDriver {
    pub fn new(record: DeviceRecord, dispatcher: ScpiDispatcher) -> Self {
        debug!("[DRIVER] Generic driver for {} ({})", record.key, record.model);
        Self { record, dispatcher }
    }
}

#[async_trait]
impl InstrumentDriver for GenericDriver {
    fn kind(&self) -> &'static str {
        "generic"
    }

    fn record(&self) -> &DeviceRecord {
        &self.record
    }

    fn dispatcher(&mut self) -> &mut ScpiDispatcher {
        &mut self.dispatcher
    }
}

/// Tektronix TDS oscilloscopes
pub struct TektronixScope {
    record: DeviceRecord,
    dispatcher: ScpiDispatcher,
}

impl TektronixScope {
    pub const CHANNELS: std::ops::RangeInclusive<u8> = 1..=4;

    pub fn new(record: DeviceRecord, dispatcher: ScpiDispatcher) -> Self {
        info!("[DRIVER] Tektronix scope driver for {} ({})", record.key, record.model);
        Self { record, dispatcher }
    }

    pub async fn autoset(&mut self) -> Result<(), DispatchError> {
        self.dispatcher.try_write("AUTOSET EXECUTE").await
    }

    /// Select `channel` as waveform source and read its curve
    pub async fn waveform(&mut self, channel: u8) -> Result<String, DispatchError> {
        if !Self::CHANNELS.contains(&channel) {
            return Err(DispatchError::Unsupported(format!("waveform channel {channel}")));
        }
        self.dispatcher.try_write(&format!("DAT:SOU CH{channel}")).await?;
        self.dispatcher.try_query("CURV?").await
    }
}

#[async_trait]
impl InstrumentDriver for TektronixScope {
    fn kind(&self) -> &'static str {
        "tektronix-scope"
    }

    fn record(&self) -> &DeviceRecord {
        &self.record
    }

    fn dispatcher(&mut self) -> &mut ScpiDispatcher {
        &mut self.dispatcher
    }

    fn procedures(&self) -> &'static [&'static str] {
        &["autoset", "waveform"]
    }

    async fn procedure(
        &mut self,
        name: &str,
        argument: Option<&str>,
    ) -> Result<Option<String>, DispatchError> {
        match name {
            "autoset" => self.autoset().await.map(|_| None),
            "waveform" => {
                let channel = argument.unwrap_or("1").trim();
                let channel = channel
                    .trim_start_matches("CH")
                    .parse::<u8>()
                    .map_err(|_| DispatchError::Unsupported(format!("waveform channel {channel}")))?;
                self.waveform(channel).await.map(Some)
            }
            other => Err(DispatchError::Unsupported(other.to_string())),
        }
    }
}

/// Keithley digital multimeters
pub struct KeithleyDmm {
    record: DeviceRecord,
    dispatcher: ScpiDispatcher,
}

impl KeithleyDmm {
    pub fn new(record: DeviceRecord, dispatcher: ScpiDispatcher) -> Self {
        info!("[DRIVER] Keithley DMM driver for {} ({})", record.key, record.model);
        Self { record, dispatcher }
    }

    pub async fn measure_voltage_dc(&mut self) -> Result<f64, DispatchError> {
        let raw = self.dispatcher.try_query("MEAS:VOLT:DC?").await?;
        parse_reading(&raw)
    }

    pub async fn measure_resistance(&mut self) -> Result<f64, DispatchError> {
        let raw = self.dispatcher.try_query("MEAS:RES?").await?;
        parse_reading(&raw)
    }
}

#[async_trait]
impl InstrumentDriver for KeithleyDmm {
    fn kind(&self) -> &'static str {
        "keithley-dmm"
    }

    fn record(&self) -> &DeviceRecord {
        &self.record
    }

    fn dispatcher(&mut self) -> &mut ScpiDispatcher {
        &mut self.dispatcher
    }

    fn procedures(&self) -> &'static [&'static str] {
        &["measure_voltage_dc", "measure_resistance"]
    }

    /// Reset also clears the status registers
    async fn reset(&mut self) -> Result<(), DispatchError> {
        self.dispatcher.try_write(scpi::RESET_COMMAND).await?;
        self.dispatcher.try_write(scpi::CLEAR_STATUS).await
    }

    async fn procedure(
        &mut self,
        name: &str,
        _argument: Option<&str>,
    ) -> Result<Option<String>, DispatchError> {
        let reading = match name {
            "measure_voltage_dc" => self.measure_voltage_dc().await?,
            "measure_resistance" => self.measure_resistance().await?,
            other => return Err(DispatchError::Unsupported(other.to_string())),
        };
        Ok(Some(reading.to_string()))
    }
}

/// First field of a reading such as `+1.234567E+00VDC,+1234.5SECS`
fn parse_reading(raw: &str) -> Result<f64, DispatchError> {
    let field = raw.split(',').next().unwrap_or(raw).trim();
    let numeric: String = field
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'E' | 'e'))
        .collect();
    numeric
        .parse()
        .map_err(|_| DispatchError::Transport(format!("unreadable measurement '{raw}'")))
}
