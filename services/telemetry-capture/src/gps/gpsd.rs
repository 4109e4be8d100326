//! gpsd JSON protocol
//!
//! gpsd streams one JSON object per line once a `?WATCH` command enables it.
//! Only TPV (time-position-velocity), SKY and VERSION reports are used.

use serde::Deserialize;

use super::types::{ParseError, PositionUpdate, SatelliteInfo};

/// Sent right after connecting to turn on JSON streaming
pub const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";

/// m/s to km/h
const MPS_TO_KMH: f64 = 3.6;

/// Lines longer than this without a newline are discarded
const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "class")]
enum Report {
    #[serde(rename = "TPV")]
    Tpv(TpvReport),
    #[serde(rename = "SKY")]
    Sky(SkyReport),
    #[serde(rename = "VERSION")]
    Version(VersionReport),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TpvReport {
    #[serde(default)]
    mode: Option<u8>,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default, rename = "altMSL")]
    alt_msl: Option<f64>,
    #[serde(default)]
    alt: Option<f64>,
    /// m/s
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    track: Option<f64>,
    #[serde(default)]
    hdop: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SkyReport {
    /// Absent in DOP-only reports
    #[serde(default)]
    satellites: Option<Vec<SkySatellite>>,
    #[serde(default)]
    hdop: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SkySatellite {
    #[serde(rename = "PRN", default)]
    prn: u32,
    #[serde(default)]
    el: Option<f64>,
    #[serde(default)]
    az: Option<f64>,
    #[serde(default)]
    ss: Option<f64>,
    #[serde(default)]
    used: bool,
}

#[derive(Debug, Deserialize)]
struct VersionReport {
    #[serde(default)]
    release: String,
    #[serde(default)]
    proto_major: u32,
    #[serde(default)]
    proto_minor: u32,
}

/// Normalized result of one gpsd line
#[derive(Debug, Clone, PartialEq)]
pub enum GpsdEvent {
    Position(PositionUpdate),
    Sky {
        satellites: Option<Vec<SatelliteInfo>>,
        update: PositionUpdate,
    },
    Version(String),
    Ignored,
}

/// Decode one JSON line
pub fn parse_report(line: &str) -> Result<GpsdEvent, ParseError> {
    let report: Report = serde_json::from_str(line.trim()).map_err(|_| ParseError::MalformedJson)?;

    let event = match report {
        Report::Tpv(tpv) => GpsdEvent::Position(PositionUpdate {
            latitude: tpv.lat,
            longitude: tpv.lon,
            altitude: Some(tpv.alt_msl.or(tpv.alt).unwrap_or(0.0)),
            speed_kmh: tpv.speed.map(|s| s * MPS_TO_KMH),
            track: tpv.track,
            fix_mode: Some(tpv.mode.unwrap_or(0)),
            hdop: tpv.hdop,
            time: tpv.time,
            ..Default::default()
        }),
        Report::Sky(sky) => {
            let satellites: Option<Vec<SatelliteInfo>> = sky.satellites.map(|list| {
                list.into_iter()
                    .map(|s| SatelliteInfo {
                        prn: s.prn,
                        elevation: s.el,
                        azimuth: s.az,
                        snr: s.ss,
                        used: s.used,
                    })
                    .collect()
            });

            let mut update = PositionUpdate {
                hdop: sky.hdop,
                ..Default::default()
            };
            if let Some(list) = &satellites {
                update.satellites_in_view = Some(list.len() as u32);
                update.satellites_used = Some(list.iter().filter(|s| s.used).count() as u32);
            }
            GpsdEvent::Sky { satellites, update }
        }
        Report::Version(v) => GpsdEvent::Version(format!(
            "gpsd {} (protocol {}.{})",
            v.release, v.proto_major, v.proto_minor
        )),
        Report::Other => GpsdEvent::Ignored,
    };

    Ok(event)
}

/// Reassembles newline-delimited lines from arbitrary read chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed. Partial trailing
    /// data stays buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }

        if self.pending.len() > MAX_LINE_LEN {
            tracing::debug!("Discarding {} bytes without a line break", self.pending.len());
            self.pending.clear();
        }

        lines
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tpv_speed_converted_to_kmh() {
        let line = r#"{"class":"TPV","mode":3,"lat":48.1,"lon":11.5,"alt":500.0,"speed":10.0,"track":90.0}"#;
        let GpsdEvent::Position(update) = parse_report(line).unwrap() else {
            panic!("expected position");
        };
        assert!((update.speed_kmh.unwrap() - 36.0).abs() < 1e-9);
        assert_eq!(update.fix_mode, Some(3));
        assert_eq!(update.altitude, Some(500.0));
    }

    #[test]
    fn test_tpv_prefers_alt_msl() {
        let line = r#"{"class":"TPV","mode":3,"altMSL":12.5,"alt":99.0}"#;
        let GpsdEvent::Position(update) = parse_report(line).unwrap() else {
            panic!("expected position");
        };
        assert_eq!(update.altitude, Some(12.5));

        let line = r#"{"class":"TPV","mode":1}"#;
        let GpsdEvent::Position(update) = parse_report(line).unwrap() else {
            panic!("expected position");
        };
        assert_eq!(update.altitude, Some(0.0));
        assert_eq!(update.latitude, None);
    }

    #[test]
    fn test_sky_counts_used() {
        let line = r#"{"class":"SKY","hdop":1.2,"satellites":[
            {"PRN":5,"el":45.0,"az":120.0,"ss":38.0,"used":true},
            {"PRN":12,"el":10.0,"az":300.0,"ss":0.0,"used":false},
            {"PRN":29,"el":70.0,"az":20.0,"ss":41.0,"used":true}]}"#;
        let GpsdEvent::Sky { satellites, update } = parse_report(&line.replace('\n', "")).unwrap() else {
            panic!("expected sky");
        };
        let satellites = satellites.expect("satellite list");
        assert_eq!(satellites.len(), 3);
        assert_eq!(satellites[1].prn, 12);
        assert_eq!(update.satellites_in_view, Some(3));
        assert_eq!(update.satellites_used, Some(2));
        assert_eq!(update.hdop, Some(1.2));
    }

    #[test]
    fn test_sky_without_satellites_keeps_counts_unset() {
        let GpsdEvent::Sky { satellites, update } = parse_report(r#"{"class":"SKY","hdop":1.1}"#).unwrap() else {
            panic!("expected sky");
        };
        assert_eq!(satellites, None);
        assert_eq!(update.satellites_in_view, None);
        assert_eq!(update.satellites_used, None);
        assert_eq!(update.hdop, Some(1.1));

        // Counts from an earlier full report survive the DOP-only one
        let mut fix = crate::gps::PositionFix::new();
        fix.apply(&PositionUpdate {
            satellites_in_view: Some(9),
            satellites_used: Some(6),
            ..Default::default()
        });
        fix.apply(&update);
        assert_eq!(fix.satellites_in_view, 9);
        assert_eq!(fix.satellites_used, 6);
        assert_eq!(fix.hdop, Some(1.1));
    }

    #[test]
    fn test_other_classes() {
        let version = r#"{"class":"VERSION","release":"3.22","proto_major":3,"proto_minor":14}"#;
        assert_eq!(
            parse_report(version).unwrap(),
            GpsdEvent::Version("gpsd 3.22 (protocol 3.14)".to_string())
        );
        assert_eq!(parse_report(r#"{"class":"DEVICES"}"#).unwrap(), GpsdEvent::Ignored);
        assert_eq!(parse_report("{\"class\":"), Err(ParseError::MalformedJson));
    }

    #[test]
    fn test_line_buffer_partial_reads() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(br#"{"class":"TPV","#).is_empty());
        assert!(buffer.pending_len() > 0);

        let lines = buffer.push(b"\"lat\":1.0}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(buffer.pending_len(), 0);

        let GpsdEvent::Position(update) = parse_report(&lines[0]).unwrap() else {
            panic!("expected position");
        };
        assert_eq!(update.latitude, Some(1.0));
    }

    #[test]
    fn test_line_buffer_multiple_lines_in_one_chunk() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"a\r\n\nb\nc");
        assert_eq!(lines, vec!["a", "b"]);
        assert_eq!(buffer.push(b"\n"), vec!["c"]);
    }
}
