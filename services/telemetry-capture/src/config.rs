//! Configuration loaded from environment variables
//!
//! Each acquisition component gets its own struct, built once and handed to
//! the session by value.

use std::path::PathBuf;
use std::str::FromStr;

use crate::sdr::GainSetting;

/// GPS transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsMode {
    /// gpsd-style JSON over TCP
    Daemon,
    /// NMEA straight from a serial receiver
    Serial,
}

impl FromStr for GpsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daemon" | "gpsd" => Ok(Self::Daemon),
            "serial" | "nmea" => Ok(Self::Serial),
            other => Err(format!("unknown GPS mode '{}'", other)),
        }
    }
}

/// GPS acquisition configuration
#[derive(Debug, Clone)]
pub struct GpsConfig {
    pub enabled: bool,
    pub mode: GpsMode,

    /// gpsd host and port
    pub daemon_host: String,
    pub daemon_port: u16,

    /// Serial receiver device and baud rate
    pub device: String,
    pub baud_rate: u32,

    /// How many raw sentences the consumer keeps
    pub raw_log_lines: usize,

    /// Append raw sentences to this file while connected
    pub track_log: Option<PathBuf>,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: GpsMode::Daemon,
            daemon_host: "localhost".to_string(),
            daemon_port: 2947,
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            raw_log_lines: 100,
            track_log: None,
        }
    }
}

/// LoRa mesh client configuration
#[derive(Debug, Clone)]
pub struct LoraConfig {
    pub enabled: bool,

    /// Mesh daemon HTTPS endpoint
    pub host: String,
    pub port: u16,
    pub status_path: String,
    pub messages_path: String,

    /// SPI device used by direct mode
    pub spi_device: PathBuf,

    /// Radio parameters (direct mode)
    pub frequency_hz: u32,
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,
    pub tx_power_dbm: i8,

    /// Service name probed before direct mode is allowed
    pub daemon_service: String,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 9443,
            status_path: "/api/v1/status".to_string(),
            messages_path: "/api/v1/messages".to_string(),
            spi_device: PathBuf::from("/dev/spidev0.0"),
            frequency_hz: 915_000_000,
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            tx_power_dbm: 17,
            daemon_service: "meshtasticd".to_string(),
        }
    }
}

/// RTC backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcKind {
    /// Chip A: 0-based weekday, oscillator-stop flag, temperature sensor
    Ds3231,
    /// Chip B: 1-based weekday, no health bits
    Ds1307,
    /// External clock tool
    System,
}

impl FromStr for RtcKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ds3231" => Ok(Self::Ds3231),
            "ds1307" => Ok(Self::Ds1307),
            "system" => Ok(Self::System),
            other => Err(format!("unknown RTC type '{}'", other)),
        }
    }
}

/// RTC driver configuration
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub enabled: bool,
    pub kind: RtcKind,

    /// Preferred I2C bus number (tried first during discovery)
    pub bus: u8,

    /// 7-bit chip address
    pub address: u16,

    /// External clock tool for the system backend
    pub clock_tool: PathBuf,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: RtcKind::Ds3231,
            bus: 1,
            address: 0x68,
            clock_tool: PathBuf::from("rtc-clock"),
        }
    }
}

/// SDR capture configuration
#[derive(Debug, Clone)]
pub struct SdrConfig {
    pub enabled: bool,
    pub device_index: u32,
    pub center_freq: u32,
    pub sample_rate: u32,
    pub gain: GainSetting,

    /// rtl_tcp executable, spawned when `spawn_server` is set
    pub rtl_tcp_path: PathBuf,
    pub spawn_server: bool,
    pub host: String,
    pub port: u16,
}

impl Default for SdrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device_index: 0,
            center_freq: 100_000_000,
            sample_rate: 2_048_000,
            gain: GainSetting::Auto,
            rtl_tcp_path: PathBuf::from("rtl_tcp"),
            spawn_server: true,
            host: "127.0.0.1".to_string(),
            port: 1234,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub gps: GpsConfig,
    pub lora: LoraConfig,
    pub rtc: RtcConfig,
    pub sdr: SdrConfig,

    /// Print every reading as a JSON line on stdout
    pub json_output: bool,

    /// Stop after this many seconds (0 = until every session ends)
    pub run_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let gps_default = GpsConfig::default();
        let gps = GpsConfig {
            enabled: env_flag("GPS_ENABLED", gps_default.enabled),
            mode: env_parse("GPS_MODE", gps_default.mode),
            daemon_host: env_string("GPSD_HOST", &gps_default.daemon_host),
            daemon_port: env_parse("GPSD_PORT", gps_default.daemon_port),
            device: env_string("GPS_DEVICE", &gps_default.device),
            baud_rate: env_parse("GPS_BAUD", gps_default.baud_rate),
            raw_log_lines: env_parse("GPS_RAW_LOG_LINES", gps_default.raw_log_lines),
            track_log: std::env::var("GPS_TRACK_LOG").ok().map(PathBuf::from),
        };

        let lora_default = LoraConfig::default();
        let lora = LoraConfig {
            enabled: env_flag("LORA_ENABLED", lora_default.enabled),
            host: env_string("LORA_HOST", &lora_default.host),
            port: env_parse("LORA_PORT", lora_default.port),
            spi_device: std::env::var("LORA_SPI_DEVICE")
                .map(PathBuf::from)
                .unwrap_or(lora_default.spi_device),
            frequency_hz: env_parse("LORA_FREQUENCY", lora_default.frequency_hz),
            spreading_factor: env_parse("LORA_SPREADING_FACTOR", lora_default.spreading_factor),
            bandwidth_hz: env_parse("LORA_BANDWIDTH", lora_default.bandwidth_hz),
            tx_power_dbm: env_parse("LORA_TX_POWER", lora_default.tx_power_dbm),
            ..lora_default
        };

        let rtc_default = RtcConfig::default();
        let rtc = RtcConfig {
            enabled: env_flag("RTC_ENABLED", rtc_default.enabled),
            kind: env_parse("RTC_TYPE", rtc_default.kind),
            bus: env_parse("RTC_BUS", rtc_default.bus),
            address: std::env::var("RTC_ADDRESS")
                .ok()
                .and_then(|s| parse_address(&s))
                .unwrap_or(rtc_default.address),
            clock_tool: std::env::var("RTC_CLOCK_TOOL")
                .map(PathBuf::from)
                .unwrap_or(rtc_default.clock_tool),
        };

        let sdr_default = SdrConfig::default();
        let sdr = SdrConfig {
            enabled: env_flag("SDR_ENABLED", sdr_default.enabled),
            device_index: env_parse("SDR_DEVICE_INDEX", sdr_default.device_index),
            center_freq: env_parse("SDR_CENTER_FREQ", sdr_default.center_freq),
            sample_rate: env_parse("SDR_SAMPLE_RATE", sdr_default.sample_rate),
            gain: env_parse("SDR_GAIN", sdr_default.gain),
            rtl_tcp_path: std::env::var("RTL_TCP_PATH")
                .map(PathBuf::from)
                .unwrap_or(sdr_default.rtl_tcp_path),
            spawn_server: env_flag("RTL_TCP_SPAWN", sdr_default.spawn_server),
            host: env_string("RTL_TCP_HOST", &sdr_default.host),
            port: env_parse("RTL_TCP_PORT", sdr_default.port),
        };

        Self {
            gps,
            lora,
            rtc,
            sdr,
            json_output: env_flag("TELEMETRY_JSON", false),
            run_secs: env_parse("TELEMETRY_RUN_SECS", 0),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => parse_flag(&v).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Accepts "0x68" or "104"
fn parse_address(value: &str) -> Option<u16> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x68"), Some(0x68));
        assert_eq!(parse_address("104"), Some(104));
        assert_eq!(parse_address("zz"), None);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("YES"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_mode_and_kind_parsing() {
        assert_eq!("gpsd".parse::<GpsMode>(), Ok(GpsMode::Daemon));
        assert_eq!("Serial".parse::<GpsMode>(), Ok(GpsMode::Serial));
        assert_eq!("DS1307".parse::<RtcKind>(), Ok(RtcKind::Ds1307));
        assert!("pcf8523".parse::<RtcKind>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.gps.baud_rate, 9600);
        assert_eq!(config.sdr.sample_rate, 2_048_000);
        assert_eq!(config.rtc.address, 0x68);
        assert_eq!(config.lora.frequency_hz, 915_000_000);
    }
}
