//! RTC driver - synchronous, polled on demand by the caller

use chrono::{NaiveDateTime, Timelike};
use tracing::{info, warn};

use super::bus::{self, RegisterBus};
use super::chip::{ClockHealth, ClockReading, Ds1307, Ds3231, RtcChip, TIME_BLOCK_LEN, TIME_REGISTER};
use super::system::SystemClock;
use crate::config::{RtcConfig, RtcKind};
use crate::error::{Result, TelemetryError};

enum Backend {
    Chip {
        chip: Box<dyn RtcChip>,
        bus: Box<dyn RegisterBus>,
        bus_number: Option<u8>,
    },
    System(SystemClock),
}

pub struct RtcDriver {
    config: RtcConfig,
    backend: Option<Backend>,
}

fn chip_for(kind: RtcKind) -> Option<Box<dyn RtcChip>> {
    match kind {
        RtcKind::Ds3231 => Some(Box::new(Ds3231)),
        RtcKind::Ds1307 => Some(Box::new(Ds1307)),
        RtcKind::System => None,
    }
}

impl RtcDriver {
    pub fn new(config: RtcConfig) -> Self {
        Self { config, backend: None }
    }

    /// Driver over an already-open register bus
    pub fn with_bus(kind: RtcKind, bus: Box<dyn RegisterBus>) -> Result<Self> {
        let chip = chip_for(kind)
            .ok_or_else(|| TelemetryError::InvalidArgument("system backend has no register bus".to_string()))?;
        Ok(Self {
            config: RtcConfig {
                kind,
                ..Default::default()
            },
            backend: Some(Backend::Chip {
                chip,
                bus,
                bus_number: None,
            }),
        })
    }

    /// Find the chip (or check the clock tool) and keep the handle open
    pub fn connect(&mut self) -> Result<()> {
        if self.backend.is_some() {
            return Err(TelemetryError::Conflict("RTC already connected".to_string()));
        }

        let backend = match chip_for(self.config.kind) {
            Some(chip) => {
                let address = self.config.address;
                let candidates = bus::candidate_buses(self.config.bus);
                let (bus_number, bus) = bus::discover(&candidates, |n| bus::open_i2c(n, address))?;
                info!(
                    "{} connected on I2C bus {} at 0x{:02x}",
                    chip.name(),
                    bus_number,
                    address
                );
                Backend::Chip {
                    chip,
                    bus,
                    bus_number: Some(bus_number),
                }
            }
            None => {
                let clock = SystemClock::new(&self.config.clock_tool);
                // Fails fast if the tool is missing
                let now = clock.read()?;
                info!("System clock backend via {} ({})", clock.tool().display(), now);
                Backend::System(clock)
            }
        };

        self.backend = Some(backend);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.backend.take().is_some() {
            info!("RTC disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    /// Bus the chip was found on
    pub fn bus_number(&self) -> Option<u8> {
        match &self.backend {
            Some(Backend::Chip { bus_number, .. }) => *bus_number,
            _ => None,
        }
    }

    pub fn read(&mut self) -> Result<ClockReading> {
        match self.backend_mut()? {
            Backend::Chip { chip, bus, .. } => {
                let mut registers = [0u8; TIME_BLOCK_LEN];
                bus.read_registers(TIME_REGISTER, &mut registers)?;
                let reading = chip.decode(&registers);
                if reading.health == Some(ClockHealth::OscillatorStopped) {
                    warn!("{} oscillator stopped; check the backup battery", chip.name());
                }
                Ok(reading)
            }
            Backend::System(clock) => Ok(ClockReading::from_datetime(&clock.read()?, None)),
        }
    }

    /// Set the clock. Sub-second precision is dropped.
    pub fn write(&mut self, dt: &NaiveDateTime) -> Result<()> {
        match self.backend_mut()? {
            Backend::Chip { chip, bus, .. } => {
                let registers = chip.encode(dt)?;
                bus.write_registers(TIME_REGISTER, &registers)?;
                chip.after_write(bus.as_mut())?;
                info!("{} set to {}", chip.name(), dt);
                Ok(())
            }
            Backend::System(clock) => clock.set(dt),
        }
    }

    /// Write the current local system time to the clock
    pub fn sync_from_system(&mut self) -> Result<NaiveDateTime> {
        let now = chrono::Local::now().naive_local();
        let now = now.with_nanosecond(0).unwrap_or(now);
        if let Backend::System(clock) = self.backend_mut()? {
            clock.sync_from_system()?;
            return Ok(now);
        }
        self.write(&now)?;
        Ok(now)
    }

    /// Die temperature in °C, if the backend has a sensor
    pub fn temperature(&mut self) -> Result<Option<f32>> {
        match self.backend_mut()? {
            Backend::Chip { chip, bus, .. } => chip.temperature(bus.as_mut()),
            Backend::System(_) => Ok(None),
        }
    }

    pub fn health(&mut self) -> Result<Option<ClockHealth>> {
        Ok(self.read()?.health)
    }

    fn backend_mut(&mut self) -> Result<&mut Backend> {
        self.backend
            .as_mut()
            .ok_or_else(|| TelemetryError::InvalidState("RTC not connected".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::bus::mock::{BusTransaction, MockBus};
    use chrono::NaiveDate;

    fn sample() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2031, 12, 24)
            .unwrap()
            .and_hms_opt(23, 59, 1)
            .unwrap()
    }

    #[test]
    fn test_not_connected() {
        let mut rtc = RtcDriver::new(RtcConfig::default());
        assert!(matches!(rtc.read(), Err(TelemetryError::InvalidState(_))));
        assert!(matches!(rtc.temperature(), Err(TelemetryError::InvalidState(_))));
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let bus = MockBus::default();
        let mut rtc = RtcDriver::with_bus(RtcKind::Ds3231, Box::new(bus.clone())).unwrap();

        rtc.write(&sample()).unwrap();
        let reading = rtc.read().unwrap();
        assert_eq!(reading.to_datetime(), Some(sample()));
        // 2031-12-24 is a Wednesday
        assert_eq!(reading.weekday, 3);
    }

    #[test]
    fn test_ds3231_write_is_single_block_then_clears_osf() {
        let bus = MockBus::with_registers(0x0F, &[0x80]);
        let mut rtc = RtcDriver::with_bus(RtcKind::Ds3231, Box::new(bus.clone())).unwrap();

        rtc.write(&sample()).unwrap();

        let transactions = bus.transactions();
        assert_eq!(transactions.len(), 3);
        assert!(matches!(&transactions[0], BusTransaction::Write { register: 0x00, data } if data.len() == 7));
        assert_eq!(transactions[1], BusTransaction::Read { register: 0x0F, len: 1 });
        assert_eq!(bus.register(0x0F), 0x00);
    }

    #[test]
    fn test_ds1307_write_has_no_status_access() {
        let bus = MockBus::default();
        let mut rtc = RtcDriver::with_bus(RtcKind::Ds1307, Box::new(bus.clone())).unwrap();
        rtc.write(&sample()).unwrap();

        assert_eq!(bus.transactions().len(), 1);
        // Wednesday in the 1-based convention
        assert_eq!(bus.register(0x03), 4);
        assert_eq!(rtc.health().unwrap(), None);
    }

    #[test]
    fn test_oscillator_stopped_reported_not_error() {
        let bus = MockBus::with_registers(0x00, &[0x80 | 0x12, 0x34, 0x08, 0x01, 0x02, 0x03, 0x24]);
        let mut rtc = RtcDriver::with_bus(RtcKind::Ds3231, Box::new(bus)).unwrap();
        let reading = rtc.read().unwrap();
        assert_eq!(reading.health, Some(ClockHealth::OscillatorStopped));
        assert_eq!(reading.to_string(), "2024-03-02 08:34:12");
    }

    #[test]
    fn test_invalid_year_leaves_chip_untouched() {
        let bus = MockBus::default();
        let mut rtc = RtcDriver::with_bus(RtcKind::Ds3231, Box::new(bus.clone())).unwrap();
        let dt = NaiveDate::from_ymd_opt(2150, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert!(matches!(rtc.write(&dt), Err(TelemetryError::InvalidArgument(_))));
        assert!(bus.transactions().is_empty());
    }

    #[test]
    fn test_sync_from_system_writes_chip() {
        let bus = MockBus::default();
        let mut rtc = RtcDriver::with_bus(RtcKind::Ds3231, Box::new(bus.clone())).unwrap();
        let written = rtc.sync_from_system().unwrap();

        let reading = rtc.read().unwrap();
        assert_eq!(reading.to_datetime(), Some(written));
    }

    #[test]
    fn test_system_backend_has_no_bus() {
        assert!(RtcDriver::with_bus(RtcKind::System, Box::new(MockBus::default())).is_err());
    }
}
