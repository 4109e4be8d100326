//! Telemetry bus: one ordered, non-blocking lane per acquisition source
//!
//! Each session thread gets a [`Publisher`] for its own lane; the single
//! consumer thread owns the [`BusReceiver`]. Order is preserved within a lane,
//! lanes interleave arbitrarily.

mod lane;

pub use lane::{lane, LaneStats, Publisher};

use crossbeam_channel::{Receiver, Select};
use serde::Serialize;
use std::time::Duration;

use crate::gps::GpsReading;
use crate::lora::LoraReading;
use crate::sdr::SdrReading;

/// Default lane capacities
pub const GPS_LANE_CAPACITY: usize = 1024;
pub const LORA_LANE_CAPACITY: usize = 256;
pub const SDR_LANE_CAPACITY: usize = 64;

/// Any reading delivered to the consumer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "source", content = "reading", rename_all = "lowercase")]
pub enum Reading {
    Gps(GpsReading),
    Lora(LoraReading),
    Sdr(SdrReading),
}

/// Producer handles, one per source; cloned into the sessions
#[derive(Clone)]
pub struct BusPublishers {
    pub gps: Publisher<GpsReading>,
    pub lora: Publisher<LoraReading>,
    pub sdr: Publisher<SdrReading>,
}

/// Consumer end of the bus
pub struct BusReceiver {
    gps: Receiver<GpsReading>,
    lora: Receiver<LoraReading>,
    sdr: Receiver<SdrReading>,
}

/// Build a bus with the default lane capacities
pub fn telemetry_bus() -> (BusPublishers, BusReceiver) {
    telemetry_bus_with_capacity(GPS_LANE_CAPACITY, LORA_LANE_CAPACITY, SDR_LANE_CAPACITY)
}

pub fn telemetry_bus_with_capacity(gps: usize, lora: usize, sdr: usize) -> (BusPublishers, BusReceiver) {
    let (gps_tx, gps_rx) = lane("gps", gps);
    let (lora_tx, lora_rx) = lane("lora", lora);
    let (sdr_tx, sdr_rx) = lane("sdr", sdr);

    (
        BusPublishers {
            gps: gps_tx,
            lora: lora_tx,
            sdr: sdr_tx,
        },
        BusReceiver {
            gps: gps_rx,
            lora: lora_rx,
            sdr: sdr_rx,
        },
    )
}

impl BusReceiver {
    /// Wait up to `timeout` for the next reading from any lane
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Reading> {
        let mut select = Select::new();
        let gps = select.recv(&self.gps);
        let lora = select.recv(&self.lora);
        let sdr = select.recv(&self.sdr);

        let op = select.select_timeout(timeout).ok()?;
        match op.index() {
            i if i == gps => op.recv(&self.gps).ok().map(Reading::Gps),
            i if i == lora => op.recv(&self.lora).ok().map(Reading::Lora),
            i if i == sdr => op.recv(&self.sdr).ok().map(Reading::Sdr),
            _ => None,
        }
    }

    /// Take everything currently queued, lane by lane
    pub fn drain(&self) -> Vec<Reading> {
        let mut out = Vec::new();
        out.extend(self.gps.try_iter().map(Reading::Gps));
        out.extend(self.lora.try_iter().map(Reading::Lora));
        out.extend(self.sdr.try_iter().map(Reading::Sdr));
        out
    }

    pub fn pending(&self) -> usize {
        self.gps.len() + self.lora.len() + self.sdr.len()
    }
}
