//! RTL-SDR capture and power-spectrum analysis
//!
//! 1. Open the dongle through rtl_tcp (spawned or already running)
//! 2. Read 8-bit IQ in blocks on a capture thread
//! 3. Convert the start of each block to complex floats
//! 4. FFT, shift, and publish a spectrum frame per block

mod capture;
mod demod;
mod device;
mod spectrum;

pub use capture::{CaptureSnapshot, CaptureStats, SdrEngine, SdrState, BLOCK_SAMPLES};
pub use demod::IqTable;
pub use device::{
    gain_commands, DeviceCommand, DeviceIdentity, DongleInfo, GainSetting, IqSource, RtlTcpDevice, RtlTcpServer,
    TunerType, GREETING_LEN,
};
pub use spectrum::{SpectrumAnalyzer, SpectrumFrame, ANALYSIS_SIZE};

use serde::Serialize;

/// Reading published on the SDR lane
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SdrReading {
    State {
        state: SdrState,
        message: Option<String>,
    },
    Spectrum(SpectrumFrame),
}
