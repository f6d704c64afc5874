//! Per-camera queue fan-out.
//!
//! Each camera's acquisition worker is the sole producer for that camera's
//! queues. Additional subscribers (a saver, a live preview, ...) each get
//! their own channel and their own clone of every entry, so no consumer can
//! starve another. Channels are unbounded; the queue-depth monitor surfaces
//! backpressure instead of blocking the acquisition loop.

use crate::frame::QueueEntry;

/// Publisher side of one camera's consumer queues.
#[derive(Clone)]
pub struct FanOut {
    senders: Vec<flume::Sender<QueueEntry>>,
}

impl FanOut {
    pub fn new() -> Self {
        FanOut {
            senders: Vec::new(),
        }
    }

    /// Register a new subscriber queue and return its receiving end.
    pub fn subscribe(&mut self) -> flume::Receiver<QueueEntry> {
        let (tx, rx) = flume::unbounded();
        self.senders.push(tx);
        rx
    }

    /// Publish one entry to every subscriber (one clone each).
    ///
    /// A subscriber whose receiver has been dropped is skipped; the saver
    /// exiting early is already reported elsewhere and must not stall
    /// acquisition.
    pub fn publish(&self, entry: QueueEntry) {
        match self.senders.len() {
            0 => {}
            1 => {
                let _ = self.senders[0].send(entry);
            }
            _ => {
                for tx in &self.senders {
                    let _ = tx.send(entry.clone());
                }
            }
        }
    }

    /// Current depth of each subscriber queue.
    pub fn depths(&self) -> Vec<usize> {
        self.senders.iter().map(|tx| tx.len()).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.len()
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}
