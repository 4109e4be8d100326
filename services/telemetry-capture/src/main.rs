//! Telemetry Capture - command-line consumer
//!
//! Starts every enabled acquisition session, drains the telemetry bus, folds
//! GPS updates into one position fix and logs (or prints as JSON) what arrives.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use telemetry_capture::config::Config;
use telemetry_capture::gps::{GpsReading, GpsService, PositionFix, RawLog};
use telemetry_capture::lora::{LoraReading, MeshClient};
use telemetry_capture::rtc::RtcDriver;
use telemetry_capture::sdr::{SdrEngine, SdrReading, SdrState};
use telemetry_capture::{telemetry_bus, Reading};

const RECV_TIMEOUT: Duration = Duration::from_millis(500);
const RTC_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("telemetry_capture=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("===========================================");
    info!("   Telemetry Capture");
    info!("   GPS / LoRa mesh / RTC / RTL-SDR");
    info!("===========================================");

    let config = Config::from_env();
    info!("Configuration:");
    info!("  GPS: {} ({:?})", enabled(config.gps.enabled), config.gps.mode);
    info!("  LoRa: {} ({}:{})", enabled(config.lora.enabled), config.lora.host, config.lora.port);
    info!("  RTC: {} ({:?})", enabled(config.rtc.enabled), config.rtc.kind);
    info!(
        "  SDR: {} ({:.3} MHz)",
        enabled(config.sdr.enabled),
        config.sdr.center_freq as f64 / 1e6
    );

    let (publishers, receiver) = telemetry_bus();

    // GPS
    let mut gps = if config.gps.enabled {
        let mut service = GpsService::new(config.gps.clone(), publishers.gps.clone());
        match service.connect() {
            Ok(()) => {
                if let Some(path) = &config.gps.track_log {
                    service
                        .start_logging(path)
                        .with_context(|| format!("Failed to open GPS track log {}", path.display()))?;
                }
                Some(service)
            }
            Err(e) => {
                warn!("GPS not started: {}", e);
                None
            }
        }
    } else {
        None
    };

    // LoRa
    let mut lora = if config.lora.enabled {
        let mut client =
            MeshClient::new(config.lora.clone(), publishers.lora.clone()).context("Failed to build mesh HTTP client")?;
        match client.connect() {
            Ok(()) => Some(client),
            Err(e) => {
                warn!("LoRa not started: {}", e);
                None
            }
        }
    } else {
        None
    };

    // SDR
    let mut sdr = if config.sdr.enabled {
        let mut engine = SdrEngine::new(config.sdr.clone(), publishers.sdr.clone());
        match engine.initialize().and_then(|_| engine.start_capture()) {
            Ok(()) => {
                if let Some(identity) = engine.identity() {
                    info!("  SDR device: {:?}", identity);
                }
                Some(engine)
            }
            Err(e) => {
                error!("SDR not started: {}", e);
                error!("Make sure the RTL-SDR is connected and rtl_tcp is installed.");
                None
            }
        }
    } else {
        None
    };

    // RTC
    let mut rtc = if config.rtc.enabled {
        let mut driver = RtcDriver::new(config.rtc.clone());
        match driver.connect() {
            Ok(()) => {
                if let Ok(Some(temp)) = driver.temperature() {
                    info!("  RTC temperature: {:.2} °C", temp);
                }
                Some(driver)
            }
            Err(e) => {
                warn!("RTC not available: {}", e);
                None
            }
        }
    } else {
        None
    };

    // Only the sessions hold publishers from here on
    drop(publishers);

    info!("===========================================");
    info!("  Capturing...");
    if config.run_secs > 0 {
        info!("  Stopping after {} s.", config.run_secs);
    }
    info!("===========================================");

    let started = Instant::now();
    let run_limit = (config.run_secs > 0).then(|| Duration::from_secs(config.run_secs));

    let mut fix = PositionFix::new();
    let mut raw_log = RawLog::new(config.gps.raw_log_lines);
    let mut readings = 0u64;
    let mut last_rtc_poll: Option<Instant> = None;
    let mut last_status = Instant::now();

    loop {
        if let Some(reading) = receiver.recv_timeout(RECV_TIMEOUT) {
            readings += 1;
            if config.json_output {
                match serde_json::to_string(&reading) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize reading: {}", e),
                }
            }
            handle_reading(reading, &mut fix, &mut raw_log);
        }

        // Periodic RTC read
        if let Some(driver) = rtc.as_mut() {
            if last_rtc_poll.map_or(true, |t| t.elapsed() >= RTC_POLL_INTERVAL) {
                match driver.read() {
                    Ok(reading) => debug!("[RTC] {} (weekday {})", reading, reading.weekday),
                    Err(e) => warn!("RTC read failed: {}", e),
                }
                last_rtc_poll = Some(Instant::now());
            }
        }

        // Periodic status summary
        if last_status.elapsed() >= STATUS_INTERVAL {
            info!("[GPS] {}", fix.status_line());
            if let (Some(lat), Some(lon)) = (fix.latitude, fix.longitude) {
                info!("[GPS] {:.6}, {:.6}", lat, lon);
            }
            if let Some(service) = &gps {
                info!("[GPS] {}", service.stats());
            }
            if let Some(client) = &lora {
                info!("[LoRa] {:?} {}", client.state(), client.stats());
            }
            if let Some(engine) = &sdr {
                info!("[SDR] {:?} {:?}", engine.state(), engine.stats());
            }
            last_status = Instant::now();
        }

        if run_limit.map_or(false, |limit| started.elapsed() >= limit) {
            info!("Run time elapsed");
            break;
        }

        let alive = Liveness {
            gps: gps.as_ref().map_or(false, |s| s.is_connected()),
            lora: lora.as_ref().map_or(false, |c| c.is_connected()),
            sdr: sdr.as_ref().map_or(false, |e| e.state() == SdrState::Capturing),
            rtc: rtc.as_ref().map_or(false, |d| d.is_connected()),
        };
        if run_limit.is_none() && alive.all_ended(receiver.pending()) {
            info!("All sessions ended");
            break;
        }
    }

    // Cleanup
    if let Some(service) = gps.as_mut() {
        service.disconnect();
    }
    if let Some(client) = lora.as_mut() {
        client.disconnect();
    }
    if let Some(engine) = sdr.as_mut() {
        engine.shutdown();
    }
    if let Some(driver) = rtc.as_mut() {
        driver.disconnect();
    }

    // Final state transitions published during teardown
    for reading in receiver.drain() {
        readings += 1;
        handle_reading(reading, &mut fix, &mut raw_log);
    }

    info!(
        "Shutdown complete. Readings: {}, GPS updates merged: {}, raw lines kept: {}",
        readings,
        fix.updates,
        raw_log.len()
    );
    Ok(())
}

/// Which sessions can still produce work; the polled RTC counts while open
#[derive(Debug, Default, Clone, Copy)]
struct Liveness {
    gps: bool,
    lora: bool,
    sdr: bool,
    rtc: bool,
}

impl Liveness {
    fn all_ended(&self, pending: usize) -> bool {
        !(self.gps || self.lora || self.sdr || self.rtc) && pending == 0
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

fn handle_reading(reading: Reading, fix: &mut PositionFix, raw_log: &mut RawLog) {
    match reading {
        Reading::Gps(GpsReading::State { state, message }) => {
            info!("[GPS] {:?} {}", state, message.unwrap_or_default());
        }
        Reading::Gps(GpsReading::Position(update)) => {
            if fix.apply(&update) {
                debug!("[GPS] {}", fix.status_line());
            }
        }
        Reading::Gps(GpsReading::Satellites { satellites }) => fix.apply_satellites(&satellites),
        Reading::Gps(GpsReading::Raw { line }) => raw_log.push(line),

        Reading::Lora(LoraReading::State { state, message }) => {
            info!("[LoRa] {:?} {}", state, message.unwrap_or_default());
        }
        Reading::Lora(LoraReading::Message(message)) => {
            info!(
                "[LoRa] {} -> {}: {}",
                message.from.as_deref().unwrap_or("?"),
                message.to.as_deref().unwrap_or("?"),
                message.text
            );
        }
        Reading::Lora(LoraReading::Link(link)) => {
            debug!("[LoRa] RSSI {:?} SNR {:?}", link.last_rssi, link.last_snr);
        }

        Reading::Sdr(SdrReading::State { state, message }) => {
            info!("[SDR] {:?} {}", state, message.unwrap_or_default());
        }
        Reading::Sdr(SdrReading::Spectrum(frame)) => {
            debug!(
                "[SDR] {:.3} MHz: avg {:.1} dB, peak {:.1} dB at {:.3} MHz",
                frame.center_freq as f64 / 1e6,
                frame.average_db,
                frame.peak_db,
                frame.peak_freq_hz / 1e6
            );
        }
    }
}
