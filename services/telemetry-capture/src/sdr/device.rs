//! rtl_tcp device access
//!
//! rtl_tcp opens the dongle and serves raw 8-bit IQ over TCP. On connect it
//! sends a 12-byte greeting ("RTL0", tuner type, gain count, big-endian) and
//! then accepts 5-byte commands (opcode + u32 big-endian parameter).

use std::io::{self, BufRead, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SdrConfig;
use crate::error::{Result, TelemetryError};

pub const GREETING_LEN: usize = 12;
const GREETING_MAGIC: &[u8; 4] = b"RTL0";

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);
const SERVER_START_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// Tuner gain: hardware AGC or a fixed value in dB
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum GainSetting {
    #[default]
    Auto,
    Manual(f32),
}

impl FromStr for GainSetting {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match s.parse::<f32>() {
            Ok(db) if db.is_finite() => Ok(Self::Manual(db)),
            _ => Err(format!("invalid gain '{}': expected 'auto' or dB", s)),
        }
    }
}

impl std::fmt::Display for GainSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual(db) => write!(f, "{:.1} dB", db),
        }
    }
}

/// Tuner chip reported in the greeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunerType {
    Unknown,
    E4000,
    Fc0012,
    Fc0013,
    Fc2580,
    R820T,
    R828D,
}

// Discrete gains per tuner, tenths of dB
const E4000_GAINS: &[i32] = &[-10, 15, 40, 65, 90, 115, 140, 165, 190, 215, 240, 290, 340, 420];
const FC0012_GAINS: &[i32] = &[-99, -40, 71, 179, 192];
const FC0013_GAINS: &[i32] = &[
    -99, -73, -65, -63, -60, -58, -54, 58, 61, 63, 65, 67, 68, 70, 71, 179, 181, 182, 184, 186, 188, 191, 197,
];
const FC2580_GAINS: &[i32] = &[0];
// Union of every tuner's range
const MIN_GAIN_DB: f32 = -9.9;
const MAX_GAIN_DB: f32 = 49.6;

const R82XX_GAINS: &[i32] = &[
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364, 372, 386, 402, 421,
    434, 439, 445, 480, 496,
];

impl From<u32> for TunerType {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::E4000,
            2 => Self::Fc0012,
            3 => Self::Fc0013,
            4 => Self::Fc2580,
            5 => Self::R820T,
            6 => Self::R828D,
            _ => Self::Unknown,
        }
    }
}

impl TunerType {
    /// Supported gains in tenths of dB, ascending
    pub fn gains(self) -> &'static [i32] {
        match self {
            Self::Unknown => &[],
            Self::E4000 => E4000_GAINS,
            Self::Fc0012 => FC0012_GAINS,
            Self::Fc0013 => FC0013_GAINS,
            Self::Fc2580 => FC2580_GAINS,
            Self::R820T | Self::R828D => R82XX_GAINS,
        }
    }

    /// Nearest supported gain in dB; unknown tuners get the request clamped
    pub fn snap_gain(self, db: f32) -> f32 {
        let clamped = db.clamp(MIN_GAIN_DB, MAX_GAIN_DB);
        let wanted = clamped * 10.0;
        self.gains()
            .iter()
            .min_by(|&&a, &&b| (a as f32 - wanted).abs().total_cmp(&(b as f32 - wanted).abs()))
            .map_or(clamped, |&g| g as f32 / 10.0)
    }
}

/// Parsed rtl_tcp greeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DongleInfo {
    pub tuner: TunerType,
    pub gain_count: u32,
}

impl DongleInfo {
    pub fn parse(greeting: &[u8; GREETING_LEN]) -> Result<Self> {
        if &greeting[..4] != GREETING_MAGIC {
            return Err(TelemetryError::Connect(format!(
                "unexpected rtl_tcp greeting {:02x?}",
                &greeting[..4]
            )));
        }
        let tuner = u32::from_be_bytes([greeting[4], greeting[5], greeting[6], greeting[7]]);
        let gain_count = u32::from_be_bytes([greeting[8], greeting[9], greeting[10], greeting[11]]);
        Ok(Self {
            tuner: TunerType::from(tuner),
            gain_count,
        })
    }
}

/// rtl_tcp control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    CenterFreq(u32),
    SampleRate(u32),
    /// true = manual gain, false = tuner AGC
    ManualGainMode(bool),
    /// Tenths of dB
    Gain(i32),
    /// RTL2832 digital AGC
    Agc(bool),
}

impl DeviceCommand {
    pub fn encode(self) -> [u8; 5] {
        let (opcode, param) = match self {
            Self::CenterFreq(hz) => (0x01, hz),
            Self::SampleRate(rate) => (0x02, rate),
            Self::ManualGainMode(manual) => (0x03, manual as u32),
            Self::Gain(tenths) => (0x04, tenths as u32),
            Self::Agc(on) => (0x08, on as u32),
        };
        let p = param.to_be_bytes();
        [opcode, p[0], p[1], p[2], p[3]]
    }
}

/// Commands that put the tuner into `gain`, snapped for `tuner`
pub fn gain_commands(gain: GainSetting, tuner: TunerType) -> Result<(GainSetting, Vec<DeviceCommand>)> {
    match gain {
        GainSetting::Auto => Ok((GainSetting::Auto, vec![DeviceCommand::ManualGainMode(false)])),
        GainSetting::Manual(db) if !db.is_finite() => {
            Err(TelemetryError::InvalidArgument(format!("gain {} dB is not a number", db)))
        }
        GainSetting::Manual(db) => {
            let snapped = tuner.snap_gain(db);
            if (snapped - db).abs() > f32::EPSILON {
                info!("Gain {:.1} dB not supported by {:?}, using {:.1} dB", db, tuner, snapped);
            }
            Ok((
                GainSetting::Manual(snapped),
                vec![
                    DeviceCommand::ManualGainMode(true),
                    DeviceCommand::Gain((snapped * 10.0).round() as i32),
                ],
            ))
        }
    }
}

/// Source of interleaved 8-bit IQ bytes plus its control channel
pub trait IqSource: Send {
    /// Read whatever is available; `TimedOut`/`WouldBlock` means nothing arrived
    fn read_samples(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn send_command(&mut self, command: DeviceCommand) -> io::Result<()>;
}

/// Connected rtl_tcp stream
pub struct RtlTcpDevice {
    stream: TcpStream,
    info: DongleInfo,
}

impl RtlTcpDevice {
    /// Connect and read the greeting
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| TelemetryError::Connect(format!("resolve {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| TelemetryError::Connect(format!("no address for {}:{}", host, port)))?;

        let mut stream = TcpStream::connect_timeout(&addr, GREETING_TIMEOUT).map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionRefused => {
                TelemetryError::Unavailable(format!("no rtl_tcp server at {}: {}", addr, e))
            }
            _ => TelemetryError::Connect(format!("rtl_tcp {}: {}", addr, e)),
        })?;
        stream.set_nodelay(true)?;

        stream.set_read_timeout(Some(GREETING_TIMEOUT))?;
        let mut greeting = [0u8; GREETING_LEN];
        stream
            .read_exact(&mut greeting)
            .map_err(|e| TelemetryError::Connect(format!("rtl_tcp greeting: {}", e)))?;
        let info = DongleInfo::parse(&greeting)?;

        // The read timeout is the capture loop's stop-observation point
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        info!(
            "Connected to rtl_tcp at {}: tuner {:?}, {} gain steps",
            addr, info.tuner, info.gain_count
        );
        Ok(Self { stream, info })
    }

    pub fn info(&self) -> DongleInfo {
        self.info
    }
}

impl IqSource for RtlTcpDevice {
    fn read_samples(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn send_command(&mut self, command: DeviceCommand) -> io::Result<()> {
        debug!("rtl_tcp command {:?}", command);
        self.stream.write_all(&command.encode())
    }
}

/// Dongle identity as printed by the rtl-sdr tools on startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl DeviceIdentity {
    /// Serial that every unprogrammed dongle reports
    const FACTORY_SERIAL: &'static str = "00000001";

    /// Parse a listing line like "  0:  Realtek, RTL2838UHIDIR, SN: 00000001"
    pub fn from_listing_line(line: &str, device_index: u32) -> Option<Self> {
        let info = line.trim().strip_prefix(&format!("{}:", device_index))?;
        let mut fields = info.split(',').map(str::trim);

        let mut identity = Self {
            manufacturer: fields.next().and_then(Self::printable),
            product: fields.next().and_then(Self::printable),
            serial: None,
        };

        if let Some(reported) = fields.next().and_then(|f| f.strip_prefix("SN:")) {
            identity.serial = match Self::printable(reported) {
                Some(serial) if serial != Self::FACTORY_SERIAL => Some(serial),
                _ => {
                    debug!("Dongle {} reports serial '{}', deriving one", device_index, reported.trim());
                    Some(identity.derived_serial(device_index))
                }
            };
        }

        Some(identity)
    }

    /// Printable ASCII of `raw`, or None when nothing is left
    fn printable(raw: &str) -> Option<String> {
        let kept: String = raw.chars().filter(|c| c.is_ascii_graphic() || *c == ' ').collect();
        let kept = kept.trim();
        (!kept.is_empty()).then(|| kept.to_string())
    }

    /// Stable 8-hex-digit id from the names and the index
    fn derived_serial(&self, device_index: u32) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        (self.manufacturer.as_deref(), self.product.as_deref(), device_index).hash(&mut hasher);
        format!("{:08X}", hasher.finish() as u32)
    }
}

/// A spawned rtl_tcp process; killed on drop
pub struct RtlTcpServer {
    child: Child,
    identity: Arc<Mutex<Option<DeviceIdentity>>>,
}

impl RtlTcpServer {
    /// Spawn `rtl_tcp -d <index> -a <host> -p <port>` and wait until it accepts a connection
    pub fn spawn_and_connect(config: &SdrConfig) -> Result<(Self, RtlTcpDevice)> {
        info!(
            "Starting {} -d {} -a {} -p {}",
            config.rtl_tcp_path.display(),
            config.device_index,
            config.host,
            config.port
        );

        let mut child = Command::new(&config.rtl_tcp_path)
            .args([
                "-d",
                &config.device_index.to_string(),
                "-a",
                &config.host,
                "-p",
                &config.port.to_string(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TelemetryError::from_open(&config.rtl_tcp_path.display().to_string(), e))?;

        let identity = Arc::new(Mutex::new(None));

        // rtl_tcp reports progress and the device listing on stderr
        if let Some(stderr) = child.stderr.take() {
            let identity = identity.clone();
            let device_index = config.device_index;
            thread::Builder::new()
                .name("rtl_tcp-stderr".to_string())
                .spawn(move || {
                    let reader = io::BufReader::new(stderr);
                    for line in reader.lines().map_while(std::result::Result::ok) {
                        if line.trim().is_empty() {
                            continue;
                        }
                        debug!("[rtl_tcp] {}", line.trim());
                        if let Some(found) = DeviceIdentity::from_listing_line(&line, device_index) {
                            if let Ok(mut slot) = identity.lock() {
                                *slot = Some(found);
                            }
                        }
                    }
                })?;
        }

        let mut server = Self { child, identity };
        let deadline = Instant::now() + SERVER_START_TIMEOUT;

        loop {
            if let Some(status) = server.child.try_wait()? {
                return Err(TelemetryError::Unavailable(format!(
                    "rtl_tcp exited during startup ({}); is the dongle plugged in?",
                    status
                )));
            }

            match RtlTcpDevice::connect(&config.host, config.port) {
                Ok(device) => return Ok((server, device)),
                Err(e) if Instant::now() < deadline => {
                    debug!("Waiting for rtl_tcp: {}", e);
                    thread::sleep(CONNECT_RETRY);
                }
                Err(e) => {
                    server.kill();
                    return Err(e);
                }
            }
        }
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn kill(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = self.child.kill() {
                    warn!("Failed to kill rtl_tcp: {}", e);
                }
                let _ = self.child.wait();
                info!("rtl_tcp stopped");
            }
        }
    }
}

impl Drop for RtlTcpServer {
    fn drop(&mut self) {
        self.kill();
    }
}
