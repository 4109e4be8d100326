//! GPS data types

use serde::Serialize;

/// Fix quality as reported by gpsd's `mode` field (0-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FixQuality {
    #[default]
    Unknown,
    NoFix,
    Fix2D,
    Fix3D,
}

impl From<u8> for FixQuality {
    fn from(mode: u8) -> Self {
        match mode {
            1 => Self::NoFix,
            2 => Self::Fix2D,
            3 => Self::Fix3D,
            _ => Self::Unknown,
        }
    }
}

impl FixQuality {
    pub fn has_fix(self) -> bool {
        matches!(self, Self::Fix2D | Self::Fix3D)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::NoFix => "No fix",
            Self::Fix2D => "2D fix",
            Self::Fix3D => "3D fix",
        }
    }
}

/// Partial position report. Only the fields the source sentence/object
/// actually carried are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionUpdate {
    /// Latitude in degrees (-90 to 90)
    pub latitude: Option<f64>,

    /// Longitude in degrees (-180 to 180)
    pub longitude: Option<f64>,

    /// Altitude in meters
    pub altitude: Option<f64>,

    /// Ground speed in km/h
    pub speed_kmh: Option<f64>,

    /// Course over ground in degrees
    pub track: Option<f64>,

    /// gpsd-style fix mode (0-3)
    pub fix_mode: Option<u8>,

    pub hdop: Option<f64>,

    /// UTC timestamp, ISO-8601
    pub time: Option<String>,

    pub satellites_in_view: Option<u32>,
    pub satellites_used: Option<u32>,
}

impl PositionUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One satellite from a sky report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SatelliteInfo {
    pub prn: u32,
    pub elevation: Option<f64>,
    pub azimuth: Option<f64>,
    /// Signal-to-noise ratio in dB-Hz
    pub snr: Option<f64>,
    pub used: bool,
}

/// Connection lifecycle of the GPS session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpsState {
    Disconnected,
    Connecting,
    Streaming,
}

/// Reading published on the GPS lane
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GpsReading {
    State {
        state: GpsState,
        message: Option<String>,
    },
    Position(PositionUpdate),
    /// Satellites in report order
    Satellites { satellites: Vec<SatelliteInfo> },
    /// Raw NMEA sentence or gpsd JSON line
    Raw { line: String },
}

/// Per-message parse failures. Always absorbed by the reader loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("not an NMEA sentence")]
    NotASentence,
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("unsupported sentence type")]
    UnsupportedSentence,
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
    #[error("malformed JSON")]
    MalformedJson,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_quality_from_mode() {
        assert_eq!(FixQuality::from(0), FixQuality::Unknown);
        assert_eq!(FixQuality::from(1), FixQuality::NoFix);
        assert_eq!(FixQuality::from(3), FixQuality::Fix3D);
        assert_eq!(FixQuality::from(9), FixQuality::Unknown);
        assert!(FixQuality::Fix2D.has_fix());
        assert!(!FixQuality::NoFix.has_fix());
    }

    #[test]
    fn test_empty_update() {
        assert!(PositionUpdate::default().is_empty());
        let update = PositionUpdate {
            track: Some(90.0),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
