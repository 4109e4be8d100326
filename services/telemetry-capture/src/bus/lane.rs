//! Bounded per-source lane with newest-wins eviction

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters shared by every publisher of one lane
#[derive(Debug, Default)]
pub struct LaneStats {
    pub published: AtomicU64,
    pub evicted: AtomicU64,
}

/// Producer side of a lane. Never blocks: when the lane is full the oldest
/// queued reading is evicted to make room.
pub struct Publisher<T> {
    source: &'static str,
    tx: Sender<T>,
    // Second handle on the queue, used only to evict the oldest entry
    evict_rx: Receiver<T>,
    stats: Arc<LaneStats>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source,
            tx: self.tx.clone(),
            evict_rx: self.evict_rx.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<T> Publisher<T> {
    /// Queue a reading, evicting the oldest one if the lane is full.
    pub fn publish(&self, reading: T) {
        let mut reading = reading;
        loop {
            match self.tx.try_send(reading) {
                Ok(()) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(TrySendError::Full(back)) => {
                    reading = back;
                    match self.evict_rx.try_recv() {
                        Ok(_) => {
                            let evicted = self.stats.evicted.fetch_add(1, Ordering::Relaxed) + 1;
                            // Log the first eviction and then every 100th
                            if evicted == 1 || evicted % 100 == 0 {
                                warn!(
                                    "[{}] Lane full, evicted oldest reading ({} evicted so far)",
                                    self.source, evicted
                                );
                            }
                        }
                        // The consumer drained it between our two calls
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => return,
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("[{}] Lane closed, dropping reading", self.source);
                    return;
                }
            }
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn stats(&self) -> &Arc<LaneStats> {
        &self.stats
    }
}

/// Create a lane with the given capacity
pub fn lane<T>(source: &'static str, capacity: usize) -> (Publisher<T>, Receiver<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    let publisher = Publisher {
        source,
        tx,
        evict_rx: rx.clone(),
        stats: Arc::new(LaneStats::default()),
    };
    (publisher, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_in_order() {
        let (publisher, rx) = lane::<u32>("test", 8);
        for i in 0..5 {
            publisher.publish(i);
        }
        let got: Vec<u32> = rx.try_iter().collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_full_lane_evicts_oldest() {
        let (publisher, rx) = lane::<u32>("test", 3);
        for i in 0..7 {
            publisher.publish(i);
        }

        let got: Vec<u32> = rx.try_iter().collect();
        assert_eq!(got, vec![4, 5, 6]);
        assert_eq!(publisher.stats().evicted.load(Ordering::Relaxed), 4);
        assert_eq!(publisher.stats().published.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_publish_never_blocks_without_consumer() {
        let (publisher, rx) = lane::<u32>("test", 2);
        drop(rx);
        for i in 0..10 {
            publisher.publish(i);
        }
        assert_eq!(publisher.stats().evicted.load(Ordering::Relaxed), 8);
    }
}
