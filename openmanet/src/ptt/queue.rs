//! Bounded playback queue between the receive loop and the audio output callback.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A bounded FIFO of decoded audio frames.
///
/// Pushes never block: when the queue is full the incoming frame is dropped, keeping the frames
/// already queued. The output callback pops on the audio thread, the receive loop and the tone
/// control push from their own tasks.
pub struct PlaybackQueue {
    frames: Mutex<VecDeque<Vec<f32>>>,
    capacity: usize,
}

impl PlaybackQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Queue a frame. Returns `false` if the queue was full and the frame was dropped.
    pub fn push(&self, frame: Vec<f32>) -> bool {
        let mut frames = self.frames.lock().unwrap();
        if frames.len() >= self.capacity {
            return false;
        }
        frames.push_back(frame);
        true
    }

    pub fn pop(&self) -> Option<Vec<f32>> {
        self.frames.lock().unwrap().pop_front()
    }

    /// Drop all queued frames. Used before tones so they play without backlog delay.
    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}
