//! GPS acquisition: gpsd JSON or serial NMEA, normalized into readings

mod fix;
pub mod gpsd;
pub mod nmea;
mod service;
mod track_log;
mod types;

pub use fix::{PositionFix, RawLog, DEFAULT_RAW_LOG_LINES};
pub use service::{GpsService, Transport};
pub use track_log::TrackLogger;
pub use types::{FixQuality, GpsReading, GpsState, ParseError, PositionUpdate, SatelliteInfo};
