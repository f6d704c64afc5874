//! Frame and queue entry types shared between the acquisition and saving stages.

use std::time::SystemTime;

use bytes::Bytes;

use crate::batch::BatchId;

/// A captured frame, tagged for saving.
///
/// The pixel payload is reference-counted (`Bytes`), so cloning a frame into
/// multiple subscriber queues does not copy pixel data. A frame is immutable
/// once it has been published.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data in the layout negotiated with the sink.
    pub data: Bytes,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Wall-clock capture timestamp.
    pub timestamp: SystemTime,
    /// Batch this frame belongs to.
    pub batch: BatchId,
    /// Sequence index within the batch, starting at 0.
    pub seq: u64,
}

/// One entry in a per-camera consumer queue.
///
/// Consumers must branch on the variant: `EndOfBatch` closes the current sink
/// so a later frame can open a fresh one, `EndOfStream` terminates the
/// consumer loop permanently.
#[derive(Debug, Clone)]
pub enum QueueEntry {
    Frame(Frame),
    EndOfBatch,
    EndOfStream,
}
