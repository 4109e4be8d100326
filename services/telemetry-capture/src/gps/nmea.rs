//! NMEA 0183 sentence parser
//!
//! Handles the three sentence types a serial receiver streams by default:
//! GGA (position fix), RMC (recommended minimum) and GSV (satellites in view).

use super::types::{ParseError, PositionUpdate};

/// Knots to km/h
const KNOTS_TO_KMH: f64 = 1.852;

/// GGA: time, position, fix quality, satellites, HDOP, altitude
#[derive(Debug, Clone, PartialEq)]
pub struct GgaFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// 0 = invalid, 1 = GPS, 2 = DGPS, ...
    pub quality: u8,
    pub satellites: Option<u32>,
    pub hdop: Option<f64>,
    pub altitude: Option<f64>,
}

/// RMC: speed, course, date/time
#[derive(Debug, Clone, PartialEq)]
pub struct RmcData {
    pub speed_knots: Option<f64>,
    pub course: Option<f64>,
    /// ISO-8601 UTC built from the time and date fields
    pub timestamp: Option<String>,
}

/// GSV: only the in-view count is decoded
#[derive(Debug, Clone, PartialEq)]
pub struct GsvSummary {
    pub satellites_in_view: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NmeaSentence {
    Gga(GgaFix),
    Rmc(RmcData),
    Gsv(GsvSummary),
}

impl NmeaSentence {
    /// Normalize into a partial position update
    pub fn to_update(&self) -> PositionUpdate {
        match self {
            Self::Gga(gga) => PositionUpdate {
                latitude: gga.latitude,
                longitude: gga.longitude,
                altitude: gga.altitude,
                hdop: gga.hdop,
                satellites_used: gga.satellites,
                // Receivers don't report 2D/3D in GGA; any valid fix counts as 3D
                fix_mode: Some(if gga.quality > 0 { 3 } else { 1 }),
                ..Default::default()
            },
            Self::Rmc(rmc) => PositionUpdate {
                speed_kmh: rmc.speed_knots.map(|kn| kn * KNOTS_TO_KMH),
                track: rmc.course,
                time: rmc.timestamp.clone(),
                ..Default::default()
            },
            Self::Gsv(gsv) => PositionUpdate {
                satellites_in_view: gsv.satellites_in_view,
                ..Default::default()
            },
        }
    }
}

/// Parse one line. Leading/trailing whitespace is ignored.
pub fn parse_sentence(line: &str) -> Result<NmeaSentence, ParseError> {
    let line = line.trim();

    // Must start with '$'
    let body = line.strip_prefix('$').ok_or(ParseError::NotASentence)?;

    let body = match body.split_once('*') {
        Some((data, checksum)) => {
            verify_checksum(data, checksum)?;
            data
        }
        None => body,
    };

    let fields: Vec<&str> = body.split(',').collect();
    // Line noise decoded lossily can put multi-byte chars in the ID
    let id = fields[0];
    if id.len() < 5 || !id.is_ascii() {
        return Err(ParseError::NotASentence);
    }

    // Talker (GP, GN, GL, ...) is ignored; the type is the last three letters
    match &id[id.len() - 3..] {
        "GGA" => parse_gga(&fields).map(NmeaSentence::Gga),
        "RMC" => parse_rmc(&fields).map(NmeaSentence::Rmc),
        "GSV" => parse_gsv(&fields).map(NmeaSentence::Gsv),
        _ => Err(ParseError::UnsupportedSentence),
    }
}

/// XOR of every byte between '$' and '*'
fn verify_checksum(data: &str, checksum: &str) -> Result<(), ParseError> {
    let expected = hex::decode(checksum.trim()).map_err(|_| ParseError::BadChecksum)?;
    if expected.len() != 1 {
        return Err(ParseError::BadChecksum);
    }

    let actual = data.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual == expected[0] {
        Ok(())
    } else {
        Err(ParseError::BadChecksum)
    }
}

// $GPGGA,hhmmss.ss,llll.ll,a,yyyyy.yy,a,q,nn,h.h,a.a,M,g.g,M,,*hh
fn parse_gga(fields: &[&str]) -> Result<GgaFix, ParseError> {
    if fields.len() < 10 {
        return Err(ParseError::InvalidField("GGA field count"));
    }

    Ok(GgaFix {
        latitude: parse_coordinate(fields[2], fields[3], 2)?,
        longitude: parse_coordinate(fields[4], fields[5], 3)?,
        quality: parse_opt::<u8>(fields[6], "quality")?.unwrap_or(0),
        satellites: parse_opt(fields[7], "satellites")?,
        hdop: parse_opt(fields[8], "hdop")?,
        altitude: parse_opt(fields[9], "altitude")?,
    })
}

// $GPRMC,hhmmss.ss,A,llll.ll,a,yyyyy.yy,a,x.x,x.x,ddmmyy,x.x,a*hh
fn parse_rmc(fields: &[&str]) -> Result<RmcData, ParseError> {
    if fields.len() < 10 {
        return Err(ParseError::InvalidField("RMC field count"));
    }

    Ok(RmcData {
        speed_knots: parse_opt(fields[7], "speed")?,
        course: parse_opt(fields[8], "course")?,
        timestamp: format_timestamp(fields[1], fields[9]),
    })
}

// $GPGSV,total,num,inview,[prn,el,az,snr]...*hh
fn parse_gsv(fields: &[&str]) -> Result<GsvSummary, ParseError> {
    if fields.len() < 4 {
        return Err(ParseError::InvalidField("GSV field count"));
    }

    Ok(GsvSummary {
        satellites_in_view: parse_opt(fields[3], "satellites in view")?,
    })
}

fn parse_opt<T: std::str::FromStr>(field: &str, name: &'static str) -> Result<Option<T>, ParseError> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(None);
    }
    field.parse().map(Some).map_err(|_| ParseError::InvalidField(name))
}

/// ddmm.mmmm / dddmm.mmmm plus hemisphere into signed degrees
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Result<Option<f64>, ParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let dot = value.find('.').unwrap_or(value.len());
    if dot < degree_digits || !value.is_ascii() {
        return Err(ParseError::InvalidField("coordinate"));
    }

    let split = dot - 2;
    let degrees: f64 = value[..split].parse().map_err(|_| ParseError::InvalidField("coordinate"))?;
    let minutes: f64 = value[split..].parse().map_err(|_| ParseError::InvalidField("coordinate"))?;
    if minutes >= 60.0 {
        return Err(ParseError::InvalidField("coordinate"));
    }

    let decimal = degrees + minutes / 60.0;
    match hemisphere.trim() {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        _ => Err(ParseError::InvalidField("hemisphere")),
    }
}

/// hhmmss(.ss) + ddmmyy into "20yy-mm-ddThh:mm:ss(.ss)Z"
fn format_timestamp(time: &str, date: &str) -> Option<String> {
    let (time, date) = (time.trim(), date.trim());
    if time.len() < 6 || date.len() != 6 || !time.is_ascii() || !date.is_ascii() {
        return None;
    }
    if !date.bytes().all(|b| b.is_ascii_digit()) || !time[..6].bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let fraction = &time[6..];
    Some(format!(
        "20{}-{}-{}T{}:{}:{}{}Z",
        &date[4..6],
        &date[2..4],
        &date[0..2],
        &time[0..2],
        &time[2..4],
        &time[4..6],
        fraction
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    #[test]
    fn test_parse_gga() {
        let sentence = parse_sentence(GGA).unwrap();
        let NmeaSentence::Gga(gga) = &sentence else {
            panic!("expected GGA, got {:?}", sentence);
        };

        assert!((gga.latitude.unwrap() - 48.1173).abs() < 1e-4);
        assert!((gga.longitude.unwrap() - 11.516_666).abs() < 1e-4);
        assert_eq!(gga.quality, 1);
        assert_eq!(gga.satellites, Some(8));
        assert_eq!(gga.hdop, Some(0.9));
        assert_eq!(gga.altitude, Some(545.4));
    }

    #[test]
    fn test_gga_quality_to_fix_mode() {
        let update = parse_sentence(GGA).unwrap().to_update();
        assert_eq!(update.fix_mode, Some(3));

        let no_fix = "$GPGGA,123519,,,,,0,00,,,M,,M,,";
        let update = parse_sentence(no_fix).unwrap().to_update();
        assert_eq!(update.fix_mode, Some(1));
        assert_eq!(update.latitude, None);
    }

    #[test]
    fn test_parse_rmc_speed_and_time() {
        let update = parse_sentence(RMC).unwrap().to_update();
        assert!((update.speed_kmh.unwrap() - 22.4 * 1.852).abs() < 1e-9);
        assert_eq!(update.track, Some(84.4));
        assert_eq!(update.time.as_deref(), Some("2094-03-23T12:35:19Z"));
        // RMC does not touch position in this parser
        assert_eq!(update.latitude, None);
    }

    #[test]
    fn test_parse_gsv_in_view() {
        let line = "$GPGSV,3,1,11,03,03,111,00,04,15,270,00,06,01,010,00,13,06,292,00";
        let update = parse_sentence(line).unwrap().to_update();
        assert_eq!(update.satellites_in_view, Some(11));
    }

    #[test]
    fn test_other_talkers_accepted() {
        let line = "$GNGGA,123519,4807.038,S,01131.000,W,2,10,1.1,12.0,M,,M,,";
        let update = parse_sentence(line).unwrap().to_update();
        assert!(update.latitude.unwrap() < 0.0);
        assert!(update.longitude.unwrap() < 0.0);
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let corrupted = GGA.replace("*47", "*48");
        assert_eq!(parse_sentence(&corrupted), Err(ParseError::BadChecksum));
        assert_eq!(parse_sentence("$GPGGA,1*ZZ"), Err(ParseError::BadChecksum));
    }

    #[test]
    fn test_rejects_non_sentences() {
        assert_eq!(parse_sentence("GPGGA,123519"), Err(ParseError::NotASentence));
        assert_eq!(parse_sentence("$GPVTG,054.7,T,,M"), Err(ParseError::UnsupportedSentence));
        assert!(matches!(
            parse_sentence("$GPGGA,123519,48x7.038,N,01131.000,E,1,08,0.9,545.4"),
            Err(ParseError::InvalidField(_))
        ));
    }

    #[test]
    fn test_non_ascii_sentence_id_rejected() {
        assert_eq!(parse_sentence("$GP\u{FFFD}A,1,2"), Err(ParseError::NotASentence));
        assert_eq!(parse_sentence("$G\u{FFFD}GGA,1,2"), Err(ParseError::NotASentence));
        assert_eq!(parse_sentence("$\u{FFFD}\u{FFFD}"), Err(ParseError::NotASentence));
    }
}
