//! Bounded reordering of out-of-order audio frames.
//!
//! Frames carry a per-source monotonic sequence number. Frames arriving out of
//! order are buffered up to a small window and re-emitted in order; frames
//! older than the window are dropped and counted as loss so the pipeline never
//! blocks waiting for a straggler.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Where an audio frame originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Client,
    Upstream,
}

/// One ephemeral audio frame. Consumed immediately by the codec/adapter,
/// never persisted.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sequence_number: u64,
    pub payload: Bytes,
    pub captured_at_ms: u64,
    pub source: FrameSource,
}

/// Sliding reorder window over sequence-numbered frames.
///
/// `push` returns the frames that became deliverable, always in sequence
/// order. A frame whose sequence number precedes the delivery cursor is
/// dropped. When the buffered span exceeds the window, the cursor advances to
/// the oldest buffered frame and every skipped sequence number is counted as
/// a lost frame.
pub struct ReorderBuffer {
    window: u64,
    next_seq: u64,
    pending: BTreeMap<u64, AudioFrame>,
    dropped: u64,
}

impl ReorderBuffer {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            next_seq: 0,
            pending: BTreeMap::new(),
            dropped: 0,
        }
    }

    /// Total frames dropped as stale or counted as gap loss.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Frames currently held back waiting for a gap to fill.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, frame: AudioFrame) -> Vec<AudioFrame> {
        let mut ready = Vec::new();

        if frame.sequence_number < self.next_seq {
            // Older than the delivery cursor: the gap it belonged to has
            // already been written off as loss.
            self.dropped += 1;
            return ready;
        }

        self.pending.insert(frame.sequence_number, frame);
        self.drain_consecutive(&mut ready);

        // Force the cursor forward once the buffered span outgrows the window.
        loop {
            let Some(&oldest) = self.pending.keys().next() else {
                break;
            };
            let newest = *self.pending.keys().next_back().unwrap_or(&oldest);
            if newest - self.next_seq + 1 <= self.window {
                break;
            }
            self.dropped += oldest - self.next_seq;
            self.next_seq = oldest;
            self.drain_consecutive(&mut ready);
        }

        ready
    }

    fn drain_consecutive(&mut self, out: &mut Vec<AudioFrame>) {
        while let Some(frame) = self.pending.remove(&self.next_seq) {
            out.push(frame);
            self.next_seq += 1;
        }
    }
}
