//! Clock chip register layouts
//!
//! Both supported chips keep time in a 7-byte BCD block at register 0x00:
//! seconds, minutes, hours, weekday, day, month, year. They differ in the
//! weekday convention and in what extra state they expose.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;

use super::bcd::{from_bcd, to_bcd};
use super::bus::RegisterBus;
use crate::error::{Result, TelemetryError};

pub const TIME_REGISTER: u8 = 0x00;
pub const TIME_BLOCK_LEN: usize = 7;

/// Chip A control/status register and its oscillator-stop flag
const DS3231_STATUS_REGISTER: u8 = 0x0F;
const DS3231_STATUS_OSF: u8 = 0x80;
const DS3231_TEMP_REGISTER: u8 = 0x11;

/// Bit 7 of the seconds register on chip A
const SECONDS_OSC_STOP: u8 = 0x80;

/// Oscillator/backup-battery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClockHealth {
    Good,
    /// Oscillator stopped at some point; the backup battery is likely dead
    OscillatorStopped,
}

/// Time as read from a clock, weekday normalized to 0 = Sunday
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockReading {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub weekday: u8,
    /// None when the backend can't tell
    pub health: Option<ClockHealth>,
}

impl ClockReading {
    pub fn from_datetime(dt: &NaiveDateTime, health: Option<ClockHealth>) -> Self {
        Self {
            year: dt.year() as u16,
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            second: dt.second() as u8,
            weekday: day_of_week(dt.year(), dt.month(), dt.day()),
            health,
        }
    }

    /// None if the registers held an impossible date
    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)?.and_hms_opt(
            self.hour as u32,
            self.minute as u32,
            self.second as u32,
        )
    }
}

impl std::fmt::Display for ClockReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Sakamoto's algorithm, 0 = Sunday
pub fn day_of_week(year: i32, month: u32, day: u32) -> u8 {
    const OFFSETS: [i32; 12] = [0, 3, 2, 5, 0, 3, 5, 1, 4, 6, 2, 4];
    let y = if month < 3 { year - 1 } else { year };
    let idx = (month.clamp(1, 12) - 1) as usize;
    (y + y / 4 - y / 100 + y / 400 + OFFSETS[idx] + day as i32).rem_euclid(7) as u8
}

/// One chip family's register conventions
pub trait RtcChip: Send {
    fn name(&self) -> &'static str;

    /// Value the chip uses for Sunday
    fn weekday_base(&self) -> u8;

    fn health_check(&self, registers: &[u8; TIME_BLOCK_LEN]) -> Option<ClockHealth>;

    fn decode(&self, registers: &[u8; TIME_BLOCK_LEN]) -> ClockReading {
        ClockReading {
            second: from_bcd(registers[0] & 0x7F),
            minute: from_bcd(registers[1] & 0x7F),
            hour: from_bcd(registers[2] & 0x3F),
            weekday: (registers[3] & 0x07).saturating_sub(self.weekday_base()),
            day: from_bcd(registers[4] & 0x3F),
            month: from_bcd(registers[5] & 0x1F),
            year: 2000 + from_bcd(registers[6]) as u16,
            health: self.health_check(registers),
        }
    }

    /// Only 2000-2099 fits the two-digit year register
    fn encode(&self, dt: &NaiveDateTime) -> Result<[u8; TIME_BLOCK_LEN]> {
        let year = dt.year();
        if !(2000..=2099).contains(&year) {
            return Err(TelemetryError::InvalidArgument(format!(
                "year {} outside 2000-2099",
                year
            )));
        }

        let weekday = day_of_week(year, dt.month(), dt.day()) + self.weekday_base();
        Ok([
            to_bcd(dt.second() as u8),
            to_bcd(dt.minute() as u8),
            to_bcd(dt.hour() as u8),
            weekday,
            to_bcd(dt.day() as u8),
            to_bcd(dt.month() as u8),
            to_bcd((year - 2000) as u8),
        ])
    }

    /// Runs after the time block has been written
    fn after_write(&self, _bus: &mut dyn RegisterBus) -> Result<()> {
        Ok(())
    }

    fn temperature(&self, _bus: &mut dyn RegisterBus) -> Result<Option<f32>> {
        Ok(None)
    }
}

/// Chip A: weekday 0-6, oscillator-stop flag, die temperature sensor
pub struct Ds3231;

impl RtcChip for Ds3231 {
    fn name(&self) -> &'static str {
        "DS3231"
    }

    fn weekday_base(&self) -> u8 {
        0
    }

    fn health_check(&self, registers: &[u8; TIME_BLOCK_LEN]) -> Option<ClockHealth> {
        if registers[0] & SECONDS_OSC_STOP != 0 {
            Some(ClockHealth::OscillatorStopped)
        } else {
            Some(ClockHealth::Good)
        }
    }

    /// Clear the oscillator-stop flag now that the time is valid again
    fn after_write(&self, bus: &mut dyn RegisterBus) -> Result<()> {
        let mut status = [0u8; 1];
        bus.read_registers(DS3231_STATUS_REGISTER, &mut status)?;
        bus.write_registers(DS3231_STATUS_REGISTER, &[status[0] & !DS3231_STATUS_OSF])
    }

    fn temperature(&self, bus: &mut dyn RegisterBus) -> Result<Option<f32>> {
        let mut raw = [0u8; 2];
        bus.read_registers(DS3231_TEMP_REGISTER, &mut raw)?;
        // Signed integer part, then two fraction bits in 0.25 steps
        let celsius = raw[0] as i8 as f32 + (raw[1] >> 6) as f32 * 0.25;
        Ok(Some(celsius))
    }
}

/// Chip B: weekday 1-7, no health bits
pub struct Ds1307;

impl RtcChip for Ds1307 {
    fn name(&self) -> &'static str {
        "DS1307"
    }

    fn weekday_base(&self) -> u8 {
        1
    }

    fn health_check(&self, _registers: &[u8; TIME_BLOCK_LEN]) -> Option<ClockHealth> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::bus::mock::{BusTransaction, MockBus};

    fn sample() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(13, 45, 30)
            .unwrap()
    }

    #[test]
    fn test_day_of_week_matches_chrono() {
        let mut date = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2100, 1, 1).unwrap();
        while date < end {
            let expected = date.weekday().num_days_from_sunday() as u8;
            assert_eq!(day_of_week(date.year(), date.month(), date.day()), expected, "{}", date);
            date = date + chrono::Duration::days(13);
        }
    }

    #[test]
    fn test_weekday_bytes_differ_by_one() {
        let dt = sample();
        let a = Ds3231.encode(&dt).unwrap();
        let b = Ds1307.encode(&dt).unwrap();
        // 2024-03-15 is a Friday
        assert_eq!(a[3], 5);
        assert_eq!(b[3], a[3] + 1);
        assert_eq!(a[..3], b[..3]);
        assert_eq!(a[4..], b[4..]);
    }

    #[test]
    fn test_encode_decode() {
        let dt = sample();
        let registers = Ds3231.encode(&dt).unwrap();
        assert_eq!(registers, [0x30, 0x45, 0x13, 5, 0x15, 0x03, 0x24]);

        let reading = Ds3231.decode(&registers);
        assert_eq!(reading.to_datetime(), Some(dt));
        assert_eq!(reading.weekday, 5);
        assert_eq!(reading.health, Some(ClockHealth::Good));

        let reading = Ds1307.decode(&Ds1307.encode(&dt).unwrap());
        assert_eq!(reading.weekday, 5);
        assert_eq!(reading.health, None);
        assert_eq!(reading.to_string(), "2024-03-15 13:45:30");
    }

    #[test]
    fn test_oscillator_stop_flag() {
        let mut registers = Ds3231.encode(&sample()).unwrap();
        registers[0] |= 0x80;
        let reading = Ds3231.decode(&registers);
        assert_eq!(reading.health, Some(ClockHealth::OscillatorStopped));
        assert_eq!(reading.second, 30);
    }

    #[test]
    fn test_year_out_of_range_rejected() {
        let dt = NaiveDate::from_ymd_opt(2100, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert!(matches!(Ds3231.encode(&dt), Err(TelemetryError::InvalidArgument(_))));
        let dt = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert!(Ds1307.encode(&dt).is_err());
    }

    #[test]
    fn test_after_write_clears_only_osf() {
        let mut bus = MockBus::with_registers(0x0F, &[0x88]);
        Ds3231.after_write(&mut bus).unwrap();
        assert_eq!(bus.register(0x0F), 0x08);
        assert_eq!(
            bus.transactions(),
            vec![
                BusTransaction::Read { register: 0x0F, len: 1 },
                BusTransaction::Write {
                    register: 0x0F,
                    data: vec![0x08]
                },
            ]
        );
    }

    #[test]
    fn test_temperature() {
        let mut bus = MockBus::with_registers(0x11, &[0x19, 0x40]);
        assert_eq!(Ds3231.temperature(&mut bus).unwrap(), Some(25.25));

        let mut bus = MockBus::with_registers(0x11, &[0xF6, 0xC0]);
        assert_eq!(Ds3231.temperature(&mut bus).unwrap(), Some(-9.25));

        assert_eq!(Ds1307.temperature(&mut bus).unwrap(), None);
    }
}
