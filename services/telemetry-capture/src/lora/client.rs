//! Mesh daemon client - HTTPS polling plus the gate into direct radio mode

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::direct::{self, DirectRadio};
use super::types::{self, DaemonStatus, LinkState, LoraReading, MeshMessage, RadioLinkStatus, RadioParams};
use crate::bus::Publisher;
use crate::config::LoraConfig;
use crate::error::{Result, TelemetryError};
use crate::session::{sleep_while_running, JoinOutcome, SessionStats, SessionWorker, StatsSnapshot, DEFAULT_JOIN_TIMEOUT};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Message ids remembered for de-duplication
const RECENT_ID_LIMIT: usize = 256;

/// Destination for broadcast sends
pub const BROADCAST: &str = "^all";

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<&'a str>,
}

/// Bounded FIFO of message ids already published
struct RecentIds {
    ids: VecDeque<u64>,
    limit: usize,
}

impl RecentIds {
    fn new(limit: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// True the first time an id is seen
    fn insert(&mut self, id: u64) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push_back(id);
        while self.ids.len() > self.limit {
            self.ids.pop_front();
        }
        true
    }
}

/// Everything the poll thread needs
struct Poller {
    http: Client,
    messages_url: String,
    publisher: Publisher<LoraReading>,
    status: Arc<Mutex<RadioLinkStatus>>,
    stats: Arc<SessionStats>,
}

impl Poller {
    fn run(self, running: &AtomicBool) {
        let mut recent = RecentIds::new(RECENT_ID_LIMIT);
        info!("LoRa polling {}", self.messages_url);

        loop {
            match self.fetch() {
                Ok(messages) => {
                    for message in messages {
                        if let Some(id) = message.id {
                            if !recent.insert(id) {
                                continue;
                            }
                        }
                        self.publish_message(message);
                    }
                }
                Err(e) => warn!("LoRa poll failed: {}", e),
            }

            if !sleep_while_running(running, POLL_INTERVAL, SLEEP_SLICE) {
                break;
            }
        }

        debug!("LoRa poller exiting");
    }

    fn fetch(&self) -> Result<Vec<MeshMessage>> {
        let response = self.http.get(&self.messages_url).send()?;
        self.stats.record_read();

        if !response.status().is_success() {
            return Err(TelemetryError::Connect(format!("HTTP {}", response.status())));
        }

        let body = response.text()?;
        types::parse_messages(&body).map_err(|e| {
            self.stats.record_parse_error();
            e
        })
    }

    fn publish_message(&self, message: MeshMessage) {
        let link = {
            let mut status = lock(&self.status);
            status.record_signal(&message).then(|| status.clone())
        };

        debug!(
            "LoRa message from {}: {}",
            message.from.as_deref().unwrap_or("?"),
            message.text
        );
        self.publisher.publish(LoraReading::Message(message));
        self.stats.record_published();

        if let Some(link) = link {
            self.publisher.publish(LoraReading::Link(link));
            self.stats.record_published();
        }
    }
}

/// Mesh client: Disconnected -> Connecting -> Connected -> Disconnected
pub struct MeshClient {
    config: LoraConfig,
    base_url: String,
    http: Client,
    publisher: Publisher<LoraReading>,
    status: Arc<Mutex<RadioLinkStatus>>,
    stats: Arc<SessionStats>,
    worker: Option<SessionWorker<()>>,
    direct: Option<DirectRadio>,
}

impl MeshClient {
    /// Client for `https://host:port` from the config
    pub fn new(config: LoraConfig, publisher: Publisher<LoraReading>) -> Result<Self> {
        let base_url = format!("https://{}:{}", config.host, config.port);
        Self::with_base_url(config, &base_url, publisher)
    }

    pub fn with_base_url(config: LoraConfig, base_url: &str, publisher: Publisher<LoraReading>) -> Result<Self> {
        // The mesh daemon serves a self-signed certificate
        let http = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            publisher,
            status: Arc::new(Mutex::new(RadioLinkStatus::default())),
            stats: SessionStats::new(),
            worker: None,
            direct: None,
        })
    }

    /// Check the daemon answers, then start polling for messages
    pub fn connect(&mut self) -> Result<()> {
        if self.direct.is_some() {
            return Err(TelemetryError::Conflict("direct radio session is active".to_string()));
        }
        if self.is_connected() {
            return Err(TelemetryError::Conflict("mesh session already connected".to_string()));
        }
        // Poller ended on its own; reap it before starting over
        if self.worker.is_some() {
            self.disconnect();
        }

        let status_url = self.url(&self.config.status_path);
        info!("Connecting to mesh daemon at {}", status_url);
        self.set_state(LinkState::Connecting, Some(format!("Connecting to {}", self.base_url)));

        let daemon_status = match self.fetch_status(&status_url) {
            Ok(status) => status,
            Err(e) => {
                error!("Mesh daemon connect failed: {}", e);
                self.set_state(LinkState::Disconnected, Some(e.to_string()));
                return Err(e);
            }
        };

        let poller = Poller {
            http: self.http.clone(),
            messages_url: self.url(&self.config.messages_path),
            publisher: self.publisher.clone(),
            status: self.status.clone(),
            stats: self.stats.clone(),
        };

        let link = {
            let mut status = lock(&self.status);
            status.apply_status(daemon_status);
            status.clone()
        };

        self.set_state(LinkState::Connected, Some("Connected to mesh daemon".to_string()));
        self.publisher.publish(LoraReading::Link(RadioLinkStatus {
            state: LinkState::Connected,
            ..link
        }));

        match SessionWorker::spawn("lora-poller", move |running| poller.run(&running)) {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.set_state(LinkState::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stop polling and wait for the poller to exit
    pub fn disconnect(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            match worker.stop(DEFAULT_JOIN_TIMEOUT) {
                JoinOutcome::Joined(()) | JoinOutcome::AlreadyStopped => {}
                JoinOutcome::TimedOut => warn!("LoRa poller did not stop in time"),
                JoinOutcome::Panicked => {
                    error!("LoRa poller ended abnormally");
                    self.set_state(LinkState::Error, Some("poller thread panicked".to_string()));
                }
            }
            info!("LoRa session ended. {}", self.stats.snapshot());
        }

        if self.state() != LinkState::Disconnected {
            self.set_state(LinkState::Disconnected, Some("Disconnected".to_string()));
        }
    }

    /// True while the poll thread is alive
    pub fn is_connected(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| w.is_running())
    }

    pub fn state(&self) -> LinkState {
        lock(&self.status).state
    }

    pub fn link_status(&self) -> RadioLinkStatus {
        lock(&self.status).clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Post a text message; `broadcast` addresses every node
    pub fn send(&self, text: &str, broadcast: bool) -> Result<()> {
        if text.trim().is_empty() {
            return Err(TelemetryError::InvalidArgument("message text is empty".to_string()));
        }
        if self.direct.is_some() {
            return Err(TelemetryError::Unsupported("send while in direct radio mode".to_string()));
        }
        if !self.is_connected() {
            return Err(TelemetryError::InvalidState("mesh session not connected".to_string()));
        }

        let body = OutgoingMessage {
            text,
            to: broadcast.then_some(BROADCAST),
        };
        let url = self.url(&self.config.messages_path);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| TelemetryError::Send(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TelemetryError::Send(format!("HTTP {} from {}", response.status(), url)));
        }

        info!("Sent LoRa message ({} bytes)", text.len());
        Ok(())
    }

    /// Take the radio's SPI bus for direct mode
    pub fn open_direct(&mut self, confirmed_daemon_stopped: bool) -> Result<()> {
        if self.direct.is_some() {
            return Err(TelemetryError::Conflict("direct radio session already open".to_string()));
        }

        let daemon_running = confirmed_daemon_stopped && direct::service_is_active(&self.config.daemon_service);
        direct::check_gate(confirmed_daemon_stopped, self.is_connected(), daemon_running)?;

        let radio = DirectRadio::open(&self.config.spi_device, RadioParams::from_config(&self.config))?;
        self.direct = Some(radio);
        Ok(())
    }

    pub fn close_direct(&mut self) {
        self.direct = None;
    }

    pub fn direct_radio(&mut self) -> Option<&mut DirectRadio> {
        self.direct.as_mut()
    }

    fn fetch_status(&self, url: &str) -> Result<DaemonStatus> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|e| TelemetryError::Connect(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(TelemetryError::Connect(format!("HTTP {} from {}", response.status(), url)));
        }

        // Metadata is optional; an unreadable body still means the daemon is up
        let body = response.text().unwrap_or_default();
        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            debug!("Status body not understood: {}", e);
            DaemonStatus::default()
        }))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn set_state(&self, state: LinkState, message: Option<String>) {
        lock(&self.status).state = state;
        self.publisher.publish(LoraReading::State { state, message });
    }
}

impl Drop for MeshClient {
    fn drop(&mut self) {
        self.disconnect();
        self.close_direct();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
