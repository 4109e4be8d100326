//! Telemetry Capture - concurrent acquisition from GPS, LoRa mesh, RTC and RTL-SDR
//!
//! Each acquisition component owns one named reader thread that normalizes its
//! link into typed readings and publishes them on the telemetry bus. A single
//! consumer drains the bus. The RTC driver is synchronous and polled on demand.

pub mod bus;
pub mod config;
pub mod error;
pub mod gps;
pub mod lora;
pub mod rtc;
pub mod sdr;
pub mod session;

pub use bus::{telemetry_bus, BusPublishers, BusReceiver, Reading};
pub use config::Config;
pub use error::{Result, TelemetryError};
