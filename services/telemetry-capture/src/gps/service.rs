//! GPS acquisition service - owns the gpsd socket or serial port and the
//! reader thread that turns its lines into readings

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::gpsd::{self, GpsdEvent, LineBuffer, WATCH_COMMAND};
use super::nmea;
use super::track_log::TrackLogger;
use super::types::{GpsReading, GpsState};
use crate::bus::Publisher;
use crate::config::{GpsConfig, GpsMode};
use crate::error::{Result, TelemetryError};
use crate::session::{JoinOutcome, SessionStats, SessionWorker, StatsSnapshot, DEFAULT_JOIN_TIMEOUT};

/// Byte stream the reader thread owns for the life of the session
pub type Transport = Box<dyn Read + Send>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const READ_BUF_SIZE: usize = 4096;

/// State shared between the service and its reader thread
struct ReaderContext {
    mode: GpsMode,
    publisher: Publisher<GpsReading>,
    state: Arc<Mutex<GpsState>>,
    stats: Arc<SessionStats>,
    track_log: Arc<Mutex<Option<TrackLogger>>>,
}

impl ReaderContext {
    fn publish(&self, reading: GpsReading) {
        self.publisher.publish(reading);
        self.stats.record_published();
    }

    fn set_state(&self, state: GpsState, message: Option<String>) {
        set_state(&self.state, &self.publisher, state, message);
    }
}

/// Publishes Disconnected if the reader thread unwinds
struct UnwindGuard<'a>(&'a ReaderContext);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("GPS reader panicked");
            self.0.set_state(GpsState::Disconnected, Some("GPS reader panicked".to_string()));
        }
    }
}

/// GPS session: Disconnected -> Connecting -> Streaming -> Disconnected
pub struct GpsService {
    config: GpsConfig,
    publisher: Publisher<GpsReading>,
    state: Arc<Mutex<GpsState>>,
    stats: Arc<SessionStats>,
    track_log: Arc<Mutex<Option<TrackLogger>>>,
    worker: Option<SessionWorker<Transport>>,
}

impl GpsService {
    pub fn new(config: GpsConfig, publisher: Publisher<GpsReading>) -> Self {
        Self {
            config,
            publisher,
            state: Arc::new(Mutex::new(GpsState::Disconnected)),
            stats: SessionStats::new(),
            track_log: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    /// Open the configured transport and start streaming. A failed connect
    /// leaves the service Disconnected and is not retried.
    pub fn connect(&mut self) -> Result<()> {
        self.ensure_idle()?;

        let target = match self.config.mode {
            GpsMode::Daemon => format!("gpsd at {}:{}", self.config.daemon_host, self.config.daemon_port),
            GpsMode::Serial => format!("{} @ {} baud", self.config.device, self.config.baud_rate),
        };
        info!("Connecting to {}", target);
        self.set_state(GpsState::Connecting, Some(format!("Connecting to {}", target)));

        let opened = match self.config.mode {
            GpsMode::Daemon => open_daemon(&self.config.daemon_host, self.config.daemon_port),
            GpsMode::Serial => open_serial(&self.config.device, self.config.baud_rate),
        };

        match opened {
            Ok(transport) => self.start_with_transport(transport, self.config.mode),
            Err(e) => {
                error!("GPS connect failed: {}", e);
                self.set_state(GpsState::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Start the reader on an already-open transport
    pub fn start_with_transport(&mut self, transport: Transport, mode: GpsMode) -> Result<()> {
        self.ensure_idle()?;

        let ctx = ReaderContext {
            mode,
            publisher: self.publisher.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            track_log: self.track_log.clone(),
        };

        // Streaming is published before the thread can report anything
        self.set_state(GpsState::Streaming, Some("Connected".to_string()));

        match SessionWorker::spawn("gps-reader", move |running| run_reader(transport, &running, &ctx)) {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.set_state(GpsState::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stop the reader, wait for it, then close the transport it hands back
    pub fn disconnect(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            match worker.stop(DEFAULT_JOIN_TIMEOUT) {
                JoinOutcome::Joined(transport) => {
                    drop(transport);
                    debug!("GPS transport closed");
                }
                JoinOutcome::TimedOut => {
                    warn!("GPS reader still running; transport stays with the reader thread");
                }
                JoinOutcome::Panicked => error!("GPS reader thread panicked"),
                JoinOutcome::AlreadyStopped => {}
            }
            info!("GPS session ended. {}", self.stats.snapshot());
        }

        self.stop_logging();

        if self.state() != GpsState::Disconnected {
            self.set_state(GpsState::Disconnected, Some("Disconnected".to_string()));
        }
    }

    pub fn state(&self) -> GpsState {
        *lock(&self.state)
    }

    /// True while the reader thread is alive
    pub fn is_connected(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| w.is_running())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Start appending raw lines to `path`. Replaces any current log.
    pub fn start_logging(&self, path: &Path) -> Result<()> {
        let logger = TrackLogger::create(path)?;
        *lock(&self.track_log) = Some(logger);
        Ok(())
    }

    /// Returns true if a log was open
    pub fn stop_logging(&self) -> bool {
        lock(&self.track_log).take().is_some()
    }

    pub fn is_logging(&self) -> bool {
        lock(&self.track_log).is_some()
    }

    fn ensure_idle(&mut self) -> Result<()> {
        match &self.worker {
            Some(worker) if worker.is_running() => {
                Err(TelemetryError::Conflict("GPS session already connected".to_string()))
            }
            // Reader ended on its own; reclaim the transport before reconnecting
            Some(_) => {
                self.disconnect();
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn set_state(&self, state: GpsState, message: Option<String>) {
        set_state(&self.state, &self.publisher, state, message);
    }
}

impl Drop for GpsService {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_state(shared: &Mutex<GpsState>, publisher: &Publisher<GpsReading>, state: GpsState, message: Option<String>) {
    *lock(shared) = state;
    publisher.publish(GpsReading::State { state, message });
}

fn open_daemon(host: &str, port: u16) -> Result<Transport> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| TelemetryError::Connect(format!("resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| TelemetryError::Connect(format!("no address for {}:{}", host, port)))?;

    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| TelemetryError::Connect(format!("gpsd {}: {}", addr, e)))?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.write_all(WATCH_COMMAND)?;

    info!("Connected to gpsd at {}, watch enabled", addr);
    Ok(Box::new(stream))
}

/// Serial port as a plain byte stream
struct SerialTransport(Box<dyn serialport::SerialPort>);

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

fn open_serial(device: &str, baud_rate: u32) -> Result<Transport> {
    let port = serialport::new(device, baud_rate)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(ErrorKind::NotFound) => {
                TelemetryError::Unavailable(format!("{}: {}", device, e))
            }
            _ => TelemetryError::Connect(format!("{}: {}", device, e)),
        })?;

    info!("Opened serial GPS {} at {} baud", device, baud_rate);
    Ok(Box::new(SerialTransport(port)))
}

/// Reader loop. Returns the transport so the caller closes it after the join.
fn run_reader(mut transport: Transport, running: &AtomicBool, ctx: &ReaderContext) -> Transport {
    let _guard = UnwindGuard(ctx);
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut lines = LineBuffer::new();
    let mut first_line = true;
    let mut fatal: Option<String> = None;

    while running.load(Ordering::SeqCst) {
        match transport.read(&mut buf) {
            Ok(0) => {
                fatal = Some("GPS stream closed by peer".to_string());
                break;
            }
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    if first_line {
                        info!("First GPS data received");
                        first_line = false;
                    }
                    handle_line(&line, ctx);
                }
            }
            // Read timeout is the stop-observation point
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                fatal = Some(format!("GPS read error: {}", e));
                break;
            }
        }
    }

    if let Some(message) = fatal {
        error!("{}", message);
        running.store(false, Ordering::SeqCst);
        ctx.set_state(GpsState::Disconnected, Some(message));
    }

    debug!("GPS reader exiting");
    transport
}

fn handle_line(line: &str, ctx: &ReaderContext) {
    // Serial receivers emit boot banners and binary noise; only sentences count
    if ctx.mode == GpsMode::Serial && !line.starts_with('$') {
        return;
    }

    ctx.stats.record_read();
    ctx.publish(GpsReading::Raw { line: line.to_string() });

    if let Some(logger) = lock(&ctx.track_log).as_mut() {
        logger.write_line(line);
    }

    match ctx.mode {
        GpsMode::Daemon => match gpsd::parse_report(line) {
            Ok(GpsdEvent::Position(update)) => ctx.publish(GpsReading::Position(update)),
            Ok(GpsdEvent::Sky { satellites, update }) => {
                if let Some(satellites) = satellites {
                    ctx.publish(GpsReading::Satellites { satellites });
                }
                ctx.publish(GpsReading::Position(update));
            }
            Ok(GpsdEvent::Version(version)) => info!("Connected to {}", version),
            Ok(GpsdEvent::Ignored) => {}
            Err(e) => {
                ctx.stats.record_parse_error();
                debug!("Dropping gpsd line ({}): {}", e, line);
            }
        },
        GpsMode::Serial => match nmea::parse_sentence(line) {
            Ok(sentence) => ctx.publish(GpsReading::Position(sentence.to_update())),
            Err(e) => {
                ctx.stats.record_parse_error();
                debug!("Dropping NMEA sentence ({}): {}", e, line);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::lane;
    use crossbeam_channel::Receiver;
    use std::collections::VecDeque;
    use std::thread::{self, ThreadId};
    use std::time::Instant;

    /// Replays chunks, then behaves like an idle link with a read timeout
    struct ScriptedLink {
        chunks: VecDeque<Vec<u8>>,
        eof_after: bool,
        events: Arc<Mutex<Vec<(String, ThreadId)>>>,
    }

    impl ScriptedLink {
        fn new(chunks: &[&[u8]]) -> (Self, Arc<Mutex<Vec<(String, ThreadId)>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            let link = Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
                eof_after: false,
                events: events.clone(),
            };
            (link, events)
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if let Some(chunk) = self.chunks.pop_front() {
                buf[..chunk.len()].copy_from_slice(&chunk);
                return Ok(chunk.len());
            }
            if self.eof_after {
                return Ok(0);
            }
            thread::sleep(Duration::from_millis(50));
            Err(std::io::Error::from(ErrorKind::TimedOut))
        }
    }

    impl Drop for ScriptedLink {
        fn drop(&mut self) {
            self.events
                .lock()
                .unwrap()
                .push(("closed".to_string(), thread::current().id()));
        }
    }

    fn service(mode: GpsMode) -> (GpsService, Receiver<GpsReading>) {
        let (publisher, rx) = lane("gps", 64);
        let config = GpsConfig {
            mode,
            ..Default::default()
        };
        (GpsService::new(config, publisher), rx)
    }

    fn wait_for<F: Fn(&GpsReading) -> bool>(rx: &Receiver<GpsReading>, pred: F) -> Option<GpsReading> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(reading) = rx.recv_timeout(Duration::from_millis(50)) {
                if pred(&reading) {
                    return Some(reading);
                }
            }
        }
        None
    }

    #[test]
    fn test_partial_reads_yield_one_position() {
        let (link, _events) = ScriptedLink::new(&[br#"{"class":"TPV","#, b"\"lat\":1.0}\n"]);
        let (mut gps, rx) = service(GpsMode::Daemon);

        gps.start_with_transport(Box::new(link), GpsMode::Daemon).unwrap();
        assert_eq!(gps.state(), GpsState::Streaming);

        let reading = wait_for(&rx, |r| matches!(r, GpsReading::Position(_))).expect("no position");
        let GpsReading::Position(update) = reading else { unreachable!() };
        assert_eq!(update.latitude, Some(1.0));

        gps.disconnect();
        assert!(!rx.try_iter().any(|r| matches!(r, GpsReading::Position(_))));
        assert_eq!(gps.stats().units_read, 1);
    }

    #[test]
    fn test_teardown_joins_before_closing_transport() {
        let (link, events) = ScriptedLink::new(&[]);
        let (mut gps, _rx) = service(GpsMode::Daemon);
        gps.start_with_transport(Box::new(link), GpsMode::Daemon).unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        gps.disconnect();
        assert!(started.elapsed() < DEFAULT_JOIN_TIMEOUT);

        // Closed exactly once, on this thread, after the reader returned it
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "closed");
        assert_eq!(events[0].1, thread::current().id());
        assert_eq!(gps.state(), GpsState::Disconnected);
    }

    #[test]
    fn test_serial_mode_ignores_non_sentences() {
        let (link, _events) = ScriptedLink::new(&[
            b"booting receiver\r\n",
            b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n",
        ]);
        let (mut gps, rx) = service(GpsMode::Serial);
        gps.start_with_transport(Box::new(link), GpsMode::Serial).unwrap();

        let reading = wait_for(&rx, |r| matches!(r, GpsReading::Position(_))).expect("no position");
        let GpsReading::Position(update) = reading else { unreachable!() };
        assert_eq!(update.fix_mode, Some(3));

        gps.disconnect();
        let snapshot = gps.stats();
        assert_eq!(snapshot.units_read, 1);
        assert_eq!(snapshot.parse_errors, 0);
    }

    #[test]
    fn test_malformed_lines_do_not_stop_reader() {
        let (link, _events) = ScriptedLink::new(&[b"{broken\n", br#"{"class":"TPV","lat":2.0}"#, b"\n"]);
        let (mut gps, rx) = service(GpsMode::Daemon);
        gps.start_with_transport(Box::new(link), GpsMode::Daemon).unwrap();

        assert!(wait_for(&rx, |r| matches!(r, GpsReading::Position(u) if u.latitude == Some(2.0))).is_some());
        assert!(gps.is_connected());
        gps.disconnect();
        assert_eq!(gps.stats().parse_errors, 1);
    }

    #[test]
    fn test_end_of_stream_publishes_disconnected() {
        let (mut link, _events) = ScriptedLink::new(&[]);
        link.eof_after = true;
        let (mut gps, rx) = service(GpsMode::Daemon);
        gps.start_with_transport(Box::new(link), GpsMode::Daemon).unwrap();

        let reading = wait_for(&rx, |r| {
            matches!(r, GpsReading::State { state: GpsState::Disconnected, .. })
        })
        .expect("no disconnect");
        let GpsReading::State { message, .. } = reading else { unreachable!() };
        assert!(message.unwrap().contains("closed"));
        assert_eq!(gps.state(), GpsState::Disconnected);
    }

    #[test]
    fn test_serial_noise_before_valid_sentence() {
        let (link, _events) = ScriptedLink::new(&[
            b"$GP\xffA,1,2\r\n",
            b"$\xfe\xfd\xfc,,\r\n",
            b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n",
        ]);
        let (mut gps, rx) = service(GpsMode::Serial);
        gps.start_with_transport(Box::new(link), GpsMode::Serial).unwrap();

        let reading = wait_for(&rx, |r| matches!(r, GpsReading::Position(_))).expect("no position");
        let GpsReading::Position(update) = reading else { unreachable!() };
        assert_eq!(update.fix_mode, Some(3));
        assert!(gps.is_connected());
        assert_eq!(gps.state(), GpsState::Streaming);

        gps.disconnect();
        let snapshot = gps.stats();
        assert_eq!(snapshot.units_read, 3);
        assert_eq!(snapshot.parse_errors, 2);
    }

    struct PanickingLink;

    impl Read for PanickingLink {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            panic!("driver fault");
        }
    }

    #[test]
    fn test_reader_panic_publishes_disconnected() {
        let (mut gps, rx) = service(GpsMode::Daemon);
        gps.start_with_transport(Box::new(PanickingLink), GpsMode::Daemon).unwrap();

        let reading = wait_for(&rx, |r| {
            matches!(r, GpsReading::State { state: GpsState::Disconnected, .. })
        })
        .expect("no disconnect");
        let GpsReading::State { message, .. } = reading else { unreachable!() };
        assert!(message.unwrap().contains("panicked"));
        assert_eq!(gps.state(), GpsState::Disconnected);

        gps.disconnect();
        assert_eq!(gps.state(), GpsState::Disconnected);
        assert!(!rx.try_iter().any(|r| matches!(r, GpsReading::State { .. })));
    }

    #[test]
    fn test_second_start_conflicts() {
        let (first, _e1) = ScriptedLink::new(&[]);
        let (second, _e2) = ScriptedLink::new(&[]);
        let (mut gps, _rx) = service(GpsMode::Daemon);
        gps.start_with_transport(Box::new(first), GpsMode::Daemon).unwrap();

        let err = gps.start_with_transport(Box::new(second), GpsMode::Daemon).unwrap_err();
        assert!(matches!(err, TelemetryError::Conflict(_)));
        gps.disconnect();
    }

    #[test]
    fn test_connect_failure_stays_disconnected() {
        let (publisher, rx) = lane("gps", 16);
        let config = GpsConfig {
            mode: GpsMode::Serial,
            device: "/dev/does-not-exist-gps".to_string(),
            ..Default::default()
        };
        let mut gps = GpsService::new(config, publisher);

        assert!(gps.connect().is_err());
        assert_eq!(gps.state(), GpsState::Disconnected);
        let states: Vec<GpsState> = rx
            .try_iter()
            .filter_map(|r| match r {
                GpsReading::State { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![GpsState::Connecting, GpsState::Disconnected]);
    }
}
