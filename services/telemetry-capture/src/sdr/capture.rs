//! SDR capture engine
//!
//! Uninitialized -> Ready -> Capturing -> Ready -> Uninitialized. The device
//! moves into the capture thread while Capturing and comes back when capture
//! stops. Retuning while Capturing goes through a command channel so the
//! thread never has to be torn down.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{unbounded, Receiver, Sender};
use rustfft::num_complex::Complex32;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::demod::IqTable;
use super::device::{
    gain_commands, DeviceCommand, DeviceIdentity, DongleInfo, GainSetting, IqSource, RtlTcpDevice, RtlTcpServer,
    TunerType,
};
use super::spectrum::{SpectrumAnalyzer, SpectrumFrame, ANALYSIS_SIZE};
use super::SdrReading;
use crate::bus::Publisher;
use crate::config::SdrConfig;
use crate::error::{Result, TelemetryError};
use crate::session::{JoinOutcome, SessionWorker, DEFAULT_JOIN_TIMEOUT};

/// Complex samples per capture block
pub const BLOCK_SAMPLES: usize = 256 * 1024;
const BLOCK_BYTES: usize = BLOCK_SAMPLES * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SdrState {
    Uninitialized,
    Ready,
    Capturing,
    Error,
}

/// Statistics for SDR capture (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub blocks_read: AtomicU64,
    pub samples_captured: AtomicU64,
    pub frames_published: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureSnapshot {
    pub blocks_read: u64,
    pub samples_captured: u64,
    pub frames_published: u64,
}

impl CaptureStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            samples_captured: self.samples_captured.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
        }
    }
}

/// What the capture thread hands back
struct CaptureExit {
    device: Box<dyn IqSource>,
    failed: bool,
}

pub struct SdrEngine {
    config: SdrConfig,
    publisher: Publisher<SdrReading>,
    state: Arc<Mutex<SdrState>>,
    stats: Arc<CaptureStats>,
    server: Option<RtlTcpServer>,
    device: Option<Box<dyn IqSource>>,
    info: Option<DongleInfo>,
    worker: Option<SessionWorker<CaptureExit>>,
    commands: Option<Sender<DeviceCommand>>,
}

impl SdrEngine {
    pub fn new(config: SdrConfig, publisher: Publisher<SdrReading>) -> Self {
        Self {
            config,
            publisher,
            state: Arc::new(Mutex::new(SdrState::Uninitialized)),
            stats: CaptureStats::new(),
            server: None,
            device: None,
            info: None,
            worker: None,
            commands: None,
        }
    }

    /// Open the dongle (spawning rtl_tcp if configured) and apply the tuning settings
    pub fn initialize(&mut self) -> Result<()> {
        self.ensure_state(SdrState::Uninitialized, "initialize")?;

        info!("===========================================");
        info!("  Initializing RTL-SDR");
        info!("===========================================");
        info!("  Device index: {}", self.config.device_index);
        info!("  Center frequency: {:.3} MHz", self.config.center_freq as f64 / 1e6);
        info!("  Sample rate: {:.3} MSPS", self.config.sample_rate as f64 / 1e6);
        info!("  Gain: {}", self.config.gain);

        let opened = if self.config.spawn_server {
            RtlTcpServer::spawn_and_connect(&self.config).map(|(server, device)| (Some(server), device))
        } else {
            RtlTcpDevice::connect(&self.config.host, self.config.port).map(|device| (None, device))
        };

        let (server, device) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                error!("SDR initialize failed: {}", e);
                self.publish_state(SdrState::Uninitialized, Some(e.to_string()));
                return Err(e);
            }
        };

        let info = device.info();
        self.server = server;
        if let Err(e) = self.initialize_with_source(Box::new(device), info) {
            self.server = None;
            return Err(e);
        }
        Ok(())
    }

    /// Take an already-open IQ source
    pub fn initialize_with_source(&mut self, mut source: Box<dyn IqSource>, info: DongleInfo) -> Result<()> {
        self.ensure_state(SdrState::Uninitialized, "initialize")?;

        let (gain, gain_cmds) = gain_commands(self.config.gain, info.tuner)?;
        let mut commands = vec![
            DeviceCommand::SampleRate(self.config.sample_rate),
            DeviceCommand::CenterFreq(self.config.center_freq),
        ];
        commands.extend(gain_cmds);

        for command in commands {
            if let Err(e) = source.send_command(command) {
                let err = TelemetryError::Connect(format!("apply {:?}: {}", command, e));
                self.publish_state(SdrState::Uninitialized, Some(err.to_string()));
                return Err(err);
            }
        }
        self.config.gain = gain;

        self.device = Some(source);
        self.info = Some(info);
        self.set_state(SdrState::Ready, Some(format!("Tuner {:?}", info.tuner)));
        Ok(())
    }

    /// Ready -> Capturing
    pub fn start_capture(&mut self) -> Result<()> {
        self.ensure_state(SdrState::Ready, "start capture")?;
        let device = self
            .device
            .take()
            .ok_or_else(|| TelemetryError::InvalidState("no open device".to_string()))?;

        let (tx, rx) = unbounded();
        let ctx = CaptureContext {
            commands: rx,
            publisher: self.publisher.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            center_freq: self.config.center_freq,
            sample_rate: self.config.sample_rate,
        };

        self.set_state(SdrState::Capturing, Some("Capture started".to_string()));

        match SessionWorker::spawn("sdr-capture", move |running| run_capture(device, &running, ctx)) {
            Ok(worker) => {
                self.worker = Some(worker);
                self.commands = Some(tx);
                Ok(())
            }
            Err(e) => {
                // The closure (and the device in it) is gone; a reinitialize is needed
                self.close(&e.to_string());
                Err(e)
            }
        }
    }

    /// Capturing -> Ready. After a capture failure the device is closed instead.
    pub fn stop_capture(&mut self) -> Result<()> {
        let mut worker = self
            .worker
            .take()
            .ok_or_else(|| TelemetryError::InvalidState("not capturing".to_string()))?;
        self.commands = None;

        info!("Stopping RTL-SDR capture...");
        match worker.stop(DEFAULT_JOIN_TIMEOUT) {
            JoinOutcome::Joined(CaptureExit { device, failed: false }) => {
                self.device = Some(device);
                self.set_state(SdrState::Ready, Some("Capture stopped".to_string()));
            }
            JoinOutcome::Joined(CaptureExit { device, failed: true }) => {
                drop(device);
                self.close("Device closed after capture error");
            }
            JoinOutcome::TimedOut => {
                warn!("Capture thread did not exit in time; device stays with it");
                self.close("Capture thread abandoned");
            }
            JoinOutcome::Panicked | JoinOutcome::AlreadyStopped => {
                self.close("Capture thread ended abnormally");
            }
        }

        info!("SDR capture stopped. {:?}", self.stats.snapshot());
        Ok(())
    }

    /// Close everything and return to Uninitialized
    pub fn shutdown(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop_capture();
        }
        if self.state() != SdrState::Uninitialized {
            self.close("Shut down");
        }
    }

    pub fn set_center_freq(&mut self, hz: u32) -> Result<()> {
        self.apply(DeviceCommand::CenterFreq(hz))?;
        self.config.center_freq = hz;
        Ok(())
    }

    pub fn set_sample_rate(&mut self, rate: u32) -> Result<()> {
        self.apply(DeviceCommand::SampleRate(rate))?;
        self.config.sample_rate = rate;
        Ok(())
    }

    /// Returns the gain actually applied after snapping
    pub fn set_gain(&mut self, gain: GainSetting) -> Result<GainSetting> {
        let tuner = self.info.map_or(TunerType::Unknown, |i| i.tuner);
        let (applied, commands) = gain_commands(gain, tuner)?;
        for command in commands {
            self.apply(command)?;
        }
        self.config.gain = applied;
        Ok(applied)
    }

    /// Only allowed while Uninitialized; a different dongle needs a full reinitialize
    pub fn set_device_index(&mut self, index: u32) -> Result<()> {
        self.ensure_state(SdrState::Uninitialized, "change device index")?;
        self.config.device_index = index;
        Ok(())
    }

    pub fn state(&self) -> SdrState {
        *lock(&self.state)
    }

    pub fn config(&self) -> &SdrConfig {
        &self.config
    }

    pub fn dongle_info(&self) -> Option<DongleInfo> {
        self.info
    }

    /// Manufacturer/product/serial as reported by a spawned rtl_tcp
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.server.as_ref().and_then(|s| s.identity())
    }

    pub fn stats(&self) -> CaptureSnapshot {
        self.stats.snapshot()
    }

    /// Send a command to the device wherever it currently lives
    fn apply(&mut self, command: DeviceCommand) -> Result<()> {
        if let Some(tx) = &self.commands {
            return tx
                .send(command)
                .map_err(|_| TelemetryError::InvalidState("capture thread has exited".to_string()));
        }
        match self.device.as_mut() {
            Some(device) => device
                .send_command(command)
                .map_err(|e| TelemetryError::Connect(format!("apply {:?}: {}", command, e))),
            None => Err(TelemetryError::InvalidState("SDR not initialized".to_string())),
        }
    }

    fn close(&mut self, message: &str) {
        self.device = None;
        self.info = None;
        if let Some(mut server) = self.server.take() {
            server.kill();
        }
        self.set_state(SdrState::Uninitialized, Some(message.to_string()));
    }

    fn ensure_state(&self, expected: SdrState, action: &str) -> Result<()> {
        let current = self.state();
        if current == expected {
            Ok(())
        } else {
            Err(TelemetryError::InvalidState(format!(
                "cannot {} while {:?}",
                action, current
            )))
        }
    }

    fn set_state(&self, state: SdrState, message: Option<String>) {
        *lock(&self.state) = state;
        self.publisher.publish(SdrReading::State { state, message });
    }

    fn publish_state(&self, state: SdrState, message: Option<String>) {
        self.publisher.publish(SdrReading::State { state, message });
    }
}

impl Drop for SdrEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct CaptureContext {
    commands: Receiver<DeviceCommand>,
    publisher: Publisher<SdrReading>,
    state: Arc<Mutex<SdrState>>,
    stats: Arc<CaptureStats>,
    center_freq: u32,
    sample_rate: u32,
}

/// Main capture loop (runs in dedicated thread)
fn run_capture(mut device: Box<dyn IqSource>, running: &AtomicBool, mut ctx: CaptureContext) -> CaptureExit {
    let table = IqTable::new();
    let mut analyzer = SpectrumAnalyzer::new(ANALYSIS_SIZE);
    let mut window = vec![Complex32::new(0.0, 0.0); ANALYSIS_SIZE];
    let mut block = vec![0u8; BLOCK_BYTES];
    let mut filled = 0usize;
    let mut first_data = true;

    let failure = loop {
        if !running.load(Ordering::SeqCst) {
            break None;
        }

        // Retune only on block boundaries so a frame never mixes two settings
        if filled == 0 {
            if let Err(e) = apply_pending(device.as_mut(), &mut ctx) {
                break Some(format!("device command failed: {}", e));
            }
        }

        match device.read_samples(&mut block[filled..]) {
            Ok(0) => break Some("IQ stream closed (EOF)".to_string()),
            Ok(n) => {
                if first_data {
                    info!("First IQ data received ({} bytes)", n);
                    first_data = false;
                }
                filled += n;
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
                continue;
            }
            Err(e) => break Some(format!("IQ read error: {}", e)),
        }

        if filled < block.len() {
            continue;
        }
        filled = 0;

        ctx.stats.blocks_read.fetch_add(1, Ordering::Relaxed);
        ctx.stats
            .samples_captured
            .fetch_add(BLOCK_SAMPLES as u64, Ordering::Relaxed);

        let n = table.convert(&block[..ANALYSIS_SIZE * 2], &mut window);
        let frame: SpectrumFrame = analyzer.analyze(&window[..n], ctx.center_freq, ctx.sample_rate);
        ctx.publisher.publish(SdrReading::Spectrum(frame));
        ctx.stats.frames_published.fetch_add(1, Ordering::Relaxed);
    };

    let failed = failure.is_some();
    if let Some(message) = failure {
        error!("SDR capture failed: {}", message);
        running.store(false, Ordering::SeqCst);
        *lock(&ctx.state) = SdrState::Error;
        ctx.publisher.publish(SdrReading::State {
            state: SdrState::Error,
            message: Some(message),
        });
    }

    debug!("SDR capture thread exiting");
    CaptureExit { device, failed }
}

fn apply_pending(device: &mut dyn IqSource, ctx: &mut CaptureContext) -> io::Result<()> {
    for command in ctx.commands.try_iter() {
        device.send_command(command)?;
        match command {
            DeviceCommand::CenterFreq(hz) => {
                info!("Retuned to {:.3} MHz", hz as f64 / 1e6);
                ctx.center_freq = hz;
            }
            DeviceCommand::SampleRate(rate) => {
                info!("Sample rate now {:.3} MSPS", rate as f64 / 1e6);
                ctx.sample_rate = rate;
            }
            _ => {}
        }
    }
    Ok(())
}
