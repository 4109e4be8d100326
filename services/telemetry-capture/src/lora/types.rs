//! LoRa mesh data types

use serde::{Deserialize, Deserializer, Serialize};

use crate::config::LoraConfig;
use crate::error::{Result, TelemetryError};

/// Bandwidths the radio supports, in Hz
pub const SUPPORTED_BANDWIDTHS: [u32; 3] = [125_000, 250_000, 500_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Link status; RSSI/SNR stay None until the first packet carries them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadioLinkStatus {
    pub state: LinkState,
    /// dBm
    pub last_rssi: Option<f64>,
    /// dB
    pub last_snr: Option<f64>,
    pub node: Option<String>,
    pub channel: Option<String>,
    pub region: Option<String>,
}

impl Default for RadioLinkStatus {
    fn default() -> Self {
        Self {
            state: LinkState::Disconnected,
            last_rssi: None,
            last_snr: None,
            node: None,
            channel: None,
            region: None,
        }
    }
}

impl RadioLinkStatus {
    /// Take signal quality from a received message. Returns true if either value was present.
    pub fn record_signal(&mut self, message: &MeshMessage) -> bool {
        if message.rssi.is_none() && message.snr.is_none() {
            return false;
        }
        if message.rssi.is_some() {
            self.last_rssi = message.rssi;
        }
        if message.snr.is_some() {
            self.last_snr = message.snr;
        }
        true
    }

    pub fn apply_status(&mut self, status: DaemonStatus) {
        if status.node.is_some() {
            self.node = status.node;
        }
        if status.channel.is_some() {
            self.channel = status.channel;
        }
        if status.region.is_some() {
            self.region = status.region;
        }
    }
}

/// One text message received from the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    #[serde(default, deserialize_with = "string_or_number")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub to: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub channel: Option<String>,
    #[serde(default, alias = "rx_rssi", alias = "rxRssi")]
    pub rssi: Option<f64>,
    #[serde(default, alias = "rx_snr", alias = "rxSnr")]
    pub snr: Option<f64>,
    /// Unix seconds
    #[serde(default, alias = "rxTime")]
    pub rx_time: Option<i64>,
    #[serde(default)]
    pub id: Option<u64>,
}

/// Status endpoint body; every field optional
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DaemonStatus {
    #[serde(default, alias = "node_id", alias = "nodeId", deserialize_with = "string_or_number")]
    pub node: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub channel: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub region: Option<String>,
}

/// The messages endpoint answers either a bare array or a wrapper object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessagesBody {
    List(Vec<MeshMessage>),
    Wrapped { messages: Vec<MeshMessage> },
}

pub fn parse_messages(body: &str) -> Result<Vec<MeshMessage>> {
    let messages = match serde_json::from_str::<MessagesBody>(body)? {
        MessagesBody::List(messages) | MessagesBody::Wrapped { messages } => messages,
    };
    Ok(messages)
}

/// Node ids and channels show up as numbers or strings depending on firmware
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Reading published on the LoRa lane
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoraReading {
    State {
        state: LinkState,
        message: Option<String>,
    },
    Message(MeshMessage),
    Link(RadioLinkStatus),
}

/// Radio parameters for direct mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioParams {
    pub frequency_hz: u32,
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,
    pub tx_power_dbm: i8,
}

impl RadioParams {
    pub fn from_config(config: &LoraConfig) -> Self {
        Self {
            frequency_hz: config.frequency_hz,
            spreading_factor: config.spreading_factor,
            bandwidth_hz: config.bandwidth_hz,
            tx_power_dbm: config.tx_power_dbm,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(400_000_000..=1_000_000_000).contains(&self.frequency_hz) {
            return Err(TelemetryError::InvalidArgument(format!(
                "frequency {} Hz outside 400-1000 MHz",
                self.frequency_hz
            )));
        }
        if !(7..=12).contains(&self.spreading_factor) {
            return Err(TelemetryError::InvalidArgument(format!(
                "spreading factor {} outside 7-12",
                self.spreading_factor
            )));
        }
        if !SUPPORTED_BANDWIDTHS.contains(&self.bandwidth_hz) {
            return Err(TelemetryError::InvalidArgument(format!(
                "bandwidth {} Hz not one of {:?}",
                self.bandwidth_hz, SUPPORTED_BANDWIDTHS
            )));
        }
        if !(2..=20).contains(&self.tx_power_dbm) {
            return Err(TelemetryError::InvalidArgument(format!(
                "TX power {} dBm outside 2-20",
                self.tx_power_dbm
            )));
        }
        Ok(())
    }
}
