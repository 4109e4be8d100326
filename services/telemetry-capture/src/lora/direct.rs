//! Direct radio mode
//!
//! Direct mode takes the radio's SPI bus away from the mesh daemon, so it is
//! only allowed when the caller confirms the daemon is stopped and nothing on
//! this side is still talking to it. Radio command encoding is not
//! implemented; the session only holds the bus.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use super::types::RadioParams;
use crate::error::{Result, TelemetryError};

/// Why a direct session may not start
pub fn check_gate(confirmed_daemon_stopped: bool, mesh_session_active: bool, daemon_running: bool) -> Result<()> {
    if !confirmed_daemon_stopped {
        return Err(TelemetryError::Conflict(
            "direct mode needs confirmation that the mesh daemon is stopped".to_string(),
        ));
    }
    if mesh_session_active {
        return Err(TelemetryError::Conflict(
            "mesh session is active; disconnect it first".to_string(),
        ));
    }
    if daemon_running {
        return Err(TelemetryError::Conflict(
            "mesh daemon service is still running".to_string(),
        ));
    }
    Ok(())
}

/// `systemctl is-active --quiet <service>`; a missing systemctl counts as not running
pub fn service_is_active(service: &str) -> bool {
    match Command::new("systemctl")
        .args(["is-active", "--quiet", service])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Could not probe service {}: {}", service, e);
            false
        }
    }
}

/// Exclusive hold on the radio's SPI device
pub struct DirectRadio {
    spi: File,
    path: PathBuf,
    params: RadioParams,
}

impl DirectRadio {
    pub fn open(spi_device: &Path, params: RadioParams) -> Result<Self> {
        params.validate()?;

        let spi = OpenOptions::new()
            .read(true)
            .write(true)
            .open(spi_device)
            .map_err(|e| TelemetryError::from_open(&spi_device.display().to_string(), e))?;

        info!(
            "Direct radio on {}: {} Hz, SF{}, {} kHz, {} dBm",
            spi_device.display(),
            params.frequency_hz,
            params.spreading_factor,
            params.bandwidth_hz / 1000,
            params.tx_power_dbm
        );

        Ok(Self {
            spi,
            path: spi_device.to_path_buf(),
            params,
        })
    }

    pub fn params(&self) -> &RadioParams {
        &self.params
    }

    pub fn device(&self) -> &Path {
        &self.path
    }

    pub fn transmit(&mut self, _payload: &[u8]) -> Result<()> {
        Err(TelemetryError::Unsupported("direct-mode transmit".to_string()))
    }

    pub fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        Err(TelemetryError::Unsupported("direct-mode receive".to_string()))
    }
}

impl Drop for DirectRadio {
    fn drop(&mut self) {
        let _ = self.spi.sync_all();
        info!("Released {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoraConfig;

    #[test]
    fn test_gate_requires_confirmation() {
        assert!(matches!(check_gate(false, false, false), Err(TelemetryError::Conflict(_))));
        assert!(matches!(check_gate(true, true, false), Err(TelemetryError::Conflict(_))));
        assert!(matches!(check_gate(true, false, true), Err(TelemetryError::Conflict(_))));
        assert!(check_gate(true, false, false).is_ok());
    }

    #[test]
    fn test_missing_spi_device_is_unavailable() {
        let params = RadioParams::from_config(&LoraConfig::default());
        let err = DirectRadio::open(Path::new("/dev/spidev-missing.9"), params).err().unwrap();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_bad_params_rejected_before_open() {
        let params = RadioParams {
            spreading_factor: 5,
            ..RadioParams::from_config(&LoraConfig::default())
        };
        let err = DirectRadio::open(Path::new("/dev/spidev-missing.9"), params).err().unwrap();
        assert!(matches!(err, TelemetryError::InvalidArgument(_)));
    }

    #[test]
    fn test_radio_commands_unsupported() {
        let path = std::env::temp_dir().join(format!("spidev-stub-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();

        let mut radio = DirectRadio::open(&path, RadioParams::from_config(&LoraConfig::default())).unwrap();
        assert!(matches!(radio.transmit(b"hi"), Err(TelemetryError::Unsupported(_))));
        assert!(matches!(radio.receive(), Err(TelemetryError::Unsupported(_))));
        drop(radio);
        let _ = std::fs::remove_file(&path);
    }
}
