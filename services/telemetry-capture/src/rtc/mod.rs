//! Real-time clock driver: two I2C chip families plus a system-clock fallback

mod bcd;
mod bus;
mod chip;
mod driver;
mod system;

pub use bcd::{from_bcd, to_bcd};
pub use bus::{candidate_buses, discover, open_i2c, RegisterBus, FALLBACK_BUSES};
pub use chip::{day_of_week, ClockHealth, ClockReading, Ds1307, Ds3231, RtcChip};
pub use driver::RtcDriver;
pub use system::SystemClock;
