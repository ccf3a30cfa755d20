//! Sliding-window throughput estimation

use std::collections::VecDeque;
use std::time::Instant;

/// Samples kept per direction.
const WINDOW_SAMPLES: usize = 10;

/// Per-connection upload/download throughput over the last few transfers.
///
/// Only used to rank peers for unchoking, never to throttle.
#[derive(Debug, Clone, Default)]
pub struct Rate {
    upload: VecDeque<(Instant, u64)>,
    download: VecDeque<(Instant, u64)>,
}

impl Rate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_download(&mut self, bytes: usize, now: Instant) {
        push_sample(&mut self.download, bytes, now);
    }

    pub fn register_upload(&mut self, bytes: usize, now: Instant) {
        push_sample(&mut self.upload, bytes, now);
    }

    /// Bytes per second received in the window ending at `now`.
    pub fn download(&self, now: Instant) -> f64 {
        window_rate(&self.download, now)
    }

    /// Bytes per second sent in the window ending at `now`.
    pub fn upload(&self, now: Instant) -> f64 {
        window_rate(&self.upload, now)
    }
}

fn push_sample(window: &mut VecDeque<(Instant, u64)>, bytes: usize, now: Instant) {
    window.push_back((now, bytes as u64));
    while window.len() > WINDOW_SAMPLES {
        window.pop_front();
    }
}

fn window_rate(window: &VecDeque<(Instant, u64)>, now: Instant) -> f64 {
    let Some((oldest, _)) = window.front() else {
        return 0.0;
    };
    let elapsed = now.saturating_duration_since(*oldest).as_secs_f64();
    if elapsed <= 0.0 {
        return 0.0;
    }
    let total: u64 = window.iter().map(|(_, bytes)| bytes).sum();
    total as f64 / elapsed
}
