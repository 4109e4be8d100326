//! Position fix aggregation
//!
//! Readings arrive as partial updates (one NMEA sentence or gpsd object at a
//! time). The consumer folds them into a single [`PositionFix`]; a field keeps
//! its last value until a newer report supplies it.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use super::types::{FixQuality, PositionUpdate, SatelliteInfo};

/// Default number of raw sentences kept for display
pub const DEFAULT_RAW_LOG_LINES: usize = 100;

/// Aggregated GPS state
#[derive(Debug, Clone, Default, Serialize)]
pub struct PositionFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Meters
    pub altitude: Option<f64>,
    /// km/h
    pub speed_kmh: Option<f64>,
    /// Degrees
    pub track: Option<f64>,
    pub fix_quality: FixQuality,
    pub hdop: Option<f64>,
    /// UTC, ISO-8601
    pub time: Option<String>,
    pub satellites_in_view: u32,
    pub satellites_used: u32,
    /// Last sky report, in report order
    pub satellites: Vec<SatelliteInfo>,
    /// Number of updates merged
    pub updates: u64,
}

impl PositionFix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a partial update. Returns true if any field changed.
    pub fn apply(&mut self, update: &PositionUpdate) -> bool {
        let before = self.clone();
        self.updates += 1;

        // Update position only with a sane pair
        if let (Some(lat), Some(lon)) = (update.latitude, update.longitude) {
            if lat.abs() <= 90.0 && lon.abs() <= 180.0 {
                self.latitude = Some(lat);
                self.longitude = Some(lon);
            } else {
                debug!("Ignoring out-of-range position ({}, {})", lat, lon);
            }
        } else if let Some(lat) = update.latitude.filter(|l| l.abs() <= 90.0) {
            self.latitude = Some(lat);
        } else if let Some(lon) = update.longitude.filter(|l| l.abs() <= 180.0) {
            self.longitude = Some(lon);
        }

        if let Some(alt) = update.altitude {
            self.altitude = Some(alt);
        }

        if let Some(speed) = update.speed_kmh {
            if speed >= 0.0 {
                self.speed_kmh = Some(speed);
            }
        }

        if let Some(track) = update.track {
            if (0.0..=360.0).contains(&track) {
                self.track = Some(track);
            }
        }

        if let Some(mode) = update.fix_mode {
            self.fix_quality = FixQuality::from(mode);
        }

        if let Some(hdop) = update.hdop {
            self.hdop = Some(hdop);
        }

        if let Some(ref time) = update.time {
            self.time = Some(time.clone());
        }

        if let Some(n) = update.satellites_in_view {
            self.satellites_in_view = n;
        }

        if let Some(n) = update.satellites_used {
            self.satellites_used = n;
        }

        !self.same_fields(&before)
    }

    /// Replace the satellite table with the latest sky report
    pub fn apply_satellites(&mut self, satellites: &[SatelliteInfo]) {
        self.satellites = satellites.to_vec();
    }

    pub fn has_fix(&self) -> bool {
        self.fix_quality.has_fix()
    }

    /// One-line status, e.g. "3D fix | 8 satellites"
    pub fn status_line(&self) -> String {
        format!(
            "{} | {} satellites",
            self.fix_quality.description(),
            self.satellites_used
        )
    }

    fn same_fields(&self, other: &Self) -> bool {
        self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.altitude == other.altitude
            && self.speed_kmh == other.speed_kmh
            && self.track == other.track
            && self.fix_quality == other.fix_quality
            && self.hdop == other.hdop
            && self.time == other.time
            && self.satellites_in_view == other.satellites_in_view
            && self.satellites_used == other.satellites_used
    }
}

/// Most recent raw sentences, oldest first
#[derive(Debug, Clone)]
pub struct RawLog {
    lines: VecDeque<String>,
    max_lines: usize,
}

impl RawLog {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            max_lines: max_lines.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

impl Default for RawLog {
    fn default() -> Self {
        Self::new(DEFAULT_RAW_LOG_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_update_independently() {
        let mut fix = PositionFix::new();
        fix.apply(&PositionUpdate {
            latitude: Some(48.1),
            longitude: Some(11.5),
            altitude: Some(520.0),
            fix_mode: Some(3),
            ..Default::default()
        });

        // A speed-only report leaves position untouched
        let changed = fix.apply(&PositionUpdate {
            speed_kmh: Some(36.0),
            ..Default::default()
        });

        assert!(changed);
        assert_eq!(fix.latitude, Some(48.1));
        assert_eq!(fix.longitude, Some(11.5));
        assert_eq!(fix.altitude, Some(520.0));
        assert_eq!(fix.speed_kmh, Some(36.0));
        assert_eq!(fix.fix_quality, FixQuality::Fix3D);
        assert!(fix.has_fix());
    }

    #[test]
    fn test_fix_quality_follows_latest_report() {
        let mut fix = PositionFix::new();
        fix.apply(&PositionUpdate {
            fix_mode: Some(3),
            ..Default::default()
        });
        fix.apply(&PositionUpdate {
            fix_mode: Some(1),
            ..Default::default()
        });
        assert_eq!(fix.fix_quality, FixQuality::NoFix);
        assert_eq!(fix.status_line(), "No fix | 0 satellites");
    }

    #[test]
    fn test_out_of_range_position_ignored() {
        let mut fix = PositionFix::new();
        let changed = fix.apply(&PositionUpdate {
            latitude: Some(123.0),
            longitude: Some(10.0),
            ..Default::default()
        });
        assert!(!changed);
        assert_eq!(fix.latitude, None);
    }

    #[test]
    fn test_raw_log_keeps_most_recent() {
        let mut log = RawLog::new(3);
        for i in 0..5 {
            log.push(format!("$GPGGA,{}", i));
        }
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines, vec!["$GPGGA,2", "$GPGGA,3", "$GPGGA,4"]);
    }
}
