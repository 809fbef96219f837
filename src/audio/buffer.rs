//! # Pre-Ready Audio Queue
//!
//! Holds uplink chunks that arrive from the caller before the audio peer has
//! acknowledged its setup. Once the peer is ready the queue is drained in
//! arrival order.
//!
//! ## Key Features:
//! - **Bounded**: never holds more than `max_chunks` chunks
//! - **Drop-oldest**: when full, the oldest chunk makes room for the newest,
//!   so the audio flushed on readiness is the most recent speech
//! - **Owned by one session**: no locking, the session actor is the only user

use std::collections::VecDeque;

/// Bounded FIFO of already-transcoded uplink chunks.
#[derive(Debug)]
pub struct PendingAudioQueue {
    /// Queued chunks, oldest first
    chunks: VecDeque<Vec<u8>>,

    /// Maximum number of chunks kept
    max_chunks: usize,
}

impl PendingAudioQueue {
    /// Create an empty queue holding at most `max_chunks` chunks.
    ///
    /// A capacity of zero turns every push into an eviction, which behaves
    /// exactly like dropping pre-ready audio.
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(max_chunks.min(256)),
            max_chunks,
        }
    }

    /// Queue a chunk.
    ///
    /// ## Returns:
    /// - **true**: an older chunk (or this one, at zero capacity) was discarded
    /// - **false**: the chunk fit without evicting anything
    ///
    /// The caller owns the drop count (`SessionStats::dropped_chunks`).
    pub fn push(&mut self, chunk: Vec<u8>) -> bool {
        if self.max_chunks == 0 {
            return true;
        }

        let evicted = self.chunks.len() >= self.max_chunks;
        if evicted {
            self.chunks.pop_front();
        }

        self.chunks.push_back(chunk);
        evicted
    }

    /// Remove and return every queued chunk in arrival order.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.chunks.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}
