//! Acquisition session plumbing shared by the GPS, LoRa and SDR components

mod stats;
mod worker;

pub use stats::{SessionStats, StatsSnapshot};
pub use worker::{sleep_while_running, JoinOutcome, SessionWorker, DEFAULT_JOIN_TIMEOUT};
