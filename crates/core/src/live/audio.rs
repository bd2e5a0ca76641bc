use bytes::Bytes;
use std::collections::VecDeque;

/// Bounded FIFO of microphone frames held while the link is down.
/// When full, the oldest frame is dropped to make room.
#[derive(Debug)]
pub struct AudioBuffer {
    frames: VecDeque<Bytes>,
    capacity: usize,
    dropped: u64,
}

impl AudioBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Returns `true` when an older frame had to be evicted.
    pub fn push(&mut self, frame: Bytes) -> bool {
        if self.capacity == 0 {
            self.dropped += 1;
            return true;
        }
        let evicted = if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.dropped += 1;
            true
        } else {
            false
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Takes every buffered frame, oldest first.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
