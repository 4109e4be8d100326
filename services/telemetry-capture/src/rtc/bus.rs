//! Register access and I2C bus discovery

use tracing::{debug, info};

use crate::error::{Result, TelemetryError};

/// Buses tried after the configured one
pub const FALLBACK_BUSES: [u8; 3] = [1, 0, 3];

/// Register-addressed access to one chip
///
/// One owner per bus handle; the driver never shares it.
pub trait RegisterBus: Send {
    /// Read `buf.len()` consecutive registers starting at `register`
    fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<()>;

    /// Write `data` to consecutive registers starting at `register` in one transaction
    fn write_registers(&mut self, register: u8, data: &[u8]) -> Result<()>;
}

/// Configured bus first, then the fallbacks, without repeats
pub fn candidate_buses(preferred: u8) -> Vec<u8> {
    let mut buses = vec![preferred];
    for bus in FALLBACK_BUSES {
        if !buses.contains(&bus) {
            buses.push(bus);
        }
    }
    buses
}

/// Try each candidate bus in order; the first one that answers a single
/// register read wins. If none of the bus devices exist the error is
/// `Unavailable`, otherwise the last connect error is returned.
pub fn discover<F>(candidates: &[u8], mut open: F) -> Result<(u8, Box<dyn RegisterBus>)>
where
    F: FnMut(u8) -> Result<Box<dyn RegisterBus>>,
{
    let mut last_error = None;
    let mut any_present = false;

    for &bus_number in candidates {
        let mut bus = match open(bus_number) {
            Ok(bus) => bus,
            Err(e) if e.is_unavailable() => {
                debug!("I2C bus {} not present: {}", bus_number, e);
                continue;
            }
            Err(e) => {
                any_present = true;
                debug!("I2C bus {} open failed: {}", bus_number, e);
                last_error = Some(e);
                continue;
            }
        };
        any_present = true;

        let mut probe = [0u8; 1];
        match bus.read_registers(0x00, &mut probe) {
            Ok(()) => {
                info!("RTC found on I2C bus {}", bus_number);
                return Ok((bus_number, bus));
            }
            Err(e) => {
                debug!("No RTC response on I2C bus {}: {}", bus_number, e);
                last_error = Some(e);
            }
        }
    }

    if !any_present {
        return Err(TelemetryError::Unavailable(format!(
            "no I2C bus device found (tried {:?})",
            candidates
        )));
    }

    Err(last_error.unwrap_or_else(|| TelemetryError::Connect("no RTC found".to_string())))
}

#[cfg(target_os = "linux")]
mod linux {
    use std::path::PathBuf;

    use i2cdev::core::I2CDevice;
    use i2cdev::linux::LinuxI2CDevice;

    use super::RegisterBus;
    use crate::error::{Result, TelemetryError};

    /// /dev/i2c-N character device bound to one slave address
    pub struct I2cBus {
        device: LinuxI2CDevice,
        path: PathBuf,
    }

    impl I2cBus {
        pub fn open(bus: u8, address: u16) -> Result<Self> {
            let path = PathBuf::from(format!("/dev/i2c-{}", bus));
            if !path.exists() {
                return Err(TelemetryError::Unavailable(format!("{} does not exist", path.display())));
            }

            let device = LinuxI2CDevice::new(&path, address)
                .map_err(|e| TelemetryError::Connect(format!("{} @ 0x{:02x}: {}", path.display(), address, e)))?;

            Ok(Self { device, path })
        }
    }

    impl RegisterBus for I2cBus {
        fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<()> {
            let data = self
                .device
                .smbus_read_i2c_block_data(register, buf.len() as u8)
                .map_err(|e| TelemetryError::Connect(format!("{} read 0x{:02x}: {}", self.path.display(), register, e)))?;
            if data.len() < buf.len() {
                return Err(TelemetryError::Connect(format!(
                    "{} short read: {} of {} bytes",
                    self.path.display(),
                    data.len(),
                    buf.len()
                )));
            }
            buf.copy_from_slice(&data[..buf.len()]);
            Ok(())
        }

        fn write_registers(&mut self, register: u8, data: &[u8]) -> Result<()> {
            self.device
                .smbus_write_i2c_block_data(register, data)
                .map_err(|e| TelemetryError::Connect(format!("{} write 0x{:02x}: {}", self.path.display(), register, e)))
        }
    }
}

/// Open the I2C character device for `bus`
pub fn open_i2c(bus: u8, address: u16) -> Result<Box<dyn RegisterBus>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::I2cBus::open(bus, address)?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = address;
        Err(TelemetryError::Unavailable(format!(
            "I2C bus {} not supported on this platform",
            bus
        )))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::RegisterBus;
    use crate::error::{Result, TelemetryError};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum BusTransaction {
        Read { register: u8, len: usize },
        Write { register: u8, data: Vec<u8> },
    }

    #[derive(Debug, Default)]
    pub struct MockState {
        pub registers: HashMap<u8, u8>,
        pub transactions: Vec<BusTransaction>,
        pub fail: bool,
    }

    /// In-memory register file; the state is shared so tests can inspect it
    /// after the bus has been moved into a driver.
    #[derive(Clone, Default)]
    pub struct MockBus {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockBus {
        pub fn with_registers(start: u8, values: &[u8]) -> Self {
            let bus = Self::default();
            bus.set_registers(start, values);
            bus
        }

        pub fn set_registers(&self, start: u8, values: &[u8]) {
            let mut state = self.state.lock().unwrap();
            for (i, value) in values.iter().enumerate() {
                state.registers.insert(start + i as u8, *value);
            }
        }

        pub fn register(&self, register: u8) -> u8 {
            *self.state.lock().unwrap().registers.get(&register).unwrap_or(&0)
        }

        pub fn transactions(&self) -> Vec<BusTransaction> {
            self.state.lock().unwrap().transactions.clone()
        }
    }

    impl RegisterBus for MockBus {
        fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail {
                return Err(TelemetryError::Connect("NACK".to_string()));
            }
            state.transactions.push(BusTransaction::Read {
                register,
                len: buf.len(),
            });
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = *state.registers.get(&(register + i as u8)).unwrap_or(&0);
            }
            Ok(())
        }

        fn write_registers(&mut self, register: u8, data: &[u8]) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail {
                return Err(TelemetryError::Connect("NACK".to_string()));
            }
            state.transactions.push(BusTransaction::Write {
                register,
                data: data.to_vec(),
            });
            for (i, value) in data.iter().enumerate() {
                state.registers.insert(register + i as u8, *value);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBus;
    use super::*;

    #[test]
    fn test_candidate_buses_dedup() {
        assert_eq!(candidate_buses(1), vec![1, 0, 3]);
        assert_eq!(candidate_buses(3), vec![3, 1, 0]);
        assert_eq!(candidate_buses(7), vec![7, 1, 0, 3]);
    }

    #[test]
    fn test_discover_picks_first_responding_bus() {
        let mut tried = Vec::new();
        let (bus_number, _bus) = discover(&[1, 0, 3], |n| {
            tried.push(n);
            match n {
                1 => Err(TelemetryError::Unavailable("missing".to_string())),
                0 => Ok(Box::new(MockBus::default()) as Box<dyn RegisterBus>),
                _ => panic!("bus {} should not be tried", n),
            }
        })
        .unwrap();

        assert_eq!(bus_number, 0);
        assert_eq!(tried, vec![1, 0]);
    }

    #[test]
    fn test_discover_no_devices_is_unavailable() {
        let err = discover(&[1, 0, 3], |_| Err(TelemetryError::Unavailable("missing".to_string())))
            .err()
            .unwrap();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_discover_silent_chip_is_connect_error() {
        let err = discover(&[1], |_| {
            let bus = MockBus::default();
            bus.state.lock().unwrap().fail = true;
            Ok(Box::new(bus) as Box<dyn RegisterBus>)
        })
        .err()
        .unwrap();
        assert!(matches!(err, TelemetryError::Connect(_)));
    }
}
