//! Background reader thread with a cooperative stop flag
//!
//! The worker closure owns the session's hardware handle and hands it back as
//! its return value, so the handle is only dropped by the tearing-down thread
//! after the join has completed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::{Result, TelemetryError};

/// Default bound on how long teardown waits for a reader thread
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a bounded join
#[derive(Debug)]
pub enum JoinOutcome<T> {
    /// Thread exited; its return value (normally the handle) is ours now
    Joined(T),
    /// Thread panicked; the handle it owned was dropped during unwinding
    Panicked,
    /// Thread did not exit in time and keeps its handle
    TimedOut,
    /// `stop` was already called
    AlreadyStopped,
}

/// A named thread plus the flag it polls
pub struct SessionWorker<T> {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> SessionWorker<T> {
    /// Spawn `body` on a named thread. The flag is set before the thread starts.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) -> T + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let thread_flag = running.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_flag))
            .map_err(|e| {
                running.store(false, Ordering::SeqCst);
                TelemetryError::Io(e)
            })?;

        debug!("Spawned worker thread '{}'", name);

        Ok(Self {
            name: name.to_string(),
            running,
            handle: Some(handle),
        })
    }
}

impl<T> SessionWorker<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while stop has not been requested and the thread has not exited
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Ask the thread to stop at its next loop iteration
    pub fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Signal stop, then wait up to `timeout` for the thread to exit.
    pub fn stop(&mut self, timeout: Duration) -> JoinOutcome<T> {
        self.signal_stop();

        let handle = match self.handle.take() {
            Some(h) => h,
            None => return JoinOutcome::AlreadyStopped,
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "Worker '{}' did not exit within {:?}; leaving its handle with the thread",
                    self.name, timeout
                );
                // Dropping the JoinHandle detaches the thread.
                return JoinOutcome::TimedOut;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        match handle.join() {
            Ok(value) => {
                debug!("Worker '{}' joined", self.name);
                JoinOutcome::Joined(value)
            }
            Err(_) => {
                error!("Worker '{}' panicked", self.name);
                JoinOutcome::Panicked
            }
        }
    }
}

impl<T> Drop for SessionWorker<T> {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

/// Sleep for `total`, waking every `slice` to check the flag.
/// Returns false if stop was requested.
pub fn sleep_while_running(running: &AtomicBool, total: Duration, slice: Duration) -> bool {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(slice.min(deadline - now));
    }
    false
}
