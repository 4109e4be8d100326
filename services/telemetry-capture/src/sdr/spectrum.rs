//! Power spectrum of one analysis window

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;

/// Samples taken from the start of each block for analysis
pub const ANALYSIS_SIZE: usize = 1024;

/// Keeps log10 finite for empty bins
const POWER_FLOOR: f32 = 1e-10;

/// One power spectrum, zero frequency in the middle
#[derive(Debug, Clone, Serialize)]
pub struct SpectrumFrame {
    /// dB per bin, lowest frequency first
    pub power_db: Vec<f32>,
    pub center_freq: u32,
    pub sample_rate: u32,
    pub timestamp: DateTime<Utc>,
    pub average_db: f32,
    pub peak_db: f32,
    pub peak_freq_hz: f64,
}

impl SpectrumFrame {
    pub fn bins(&self) -> usize {
        self.power_db.len()
    }
}

pub struct SpectrumAnalyzer {
    size: usize,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl SpectrumAnalyzer {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let scratch = vec![Complex32::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Self {
            size,
            fft,
            buffer: vec![Complex32::new(0.0, 0.0); size],
            scratch,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// FFT the first `size` samples (zero-padded if short) and derive the stats
    pub fn analyze(&mut self, samples: &[Complex32], center_freq: u32, sample_rate: u32) -> SpectrumFrame {
        let n = self.size;
        let take = samples.len().min(n);
        self.buffer[..take].copy_from_slice(&samples[..take]);
        self.buffer[take..].fill(Complex32::new(0.0, 0.0));

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        // fftshift: second half (negative frequencies) first
        let half = n / 2;
        let power_db: Vec<f32> = self.buffer[half..]
            .iter()
            .chain(self.buffer[..half].iter())
            .map(|x| 20.0 * (x.norm() + POWER_FLOOR).log10())
            .collect();

        let average_db = power_db.iter().sum::<f32>() / n as f32;
        let (peak_bin, peak_db) = power_db
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        let peak_freq_hz =
            center_freq as f64 + (peak_bin as f64 - half as f64) * sample_rate as f64 / n as f64;

        SpectrumFrame {
            power_db,
            center_freq,
            sample_rate,
            timestamp: Utc::now(),
            average_db,
            peak_db,
            peak_freq_hz,
        }
    }
}
