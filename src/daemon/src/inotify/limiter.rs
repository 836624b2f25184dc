//! Coalesces bursts of file events.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const WINDOW: Duration = Duration::from_millis(500);
pub const MAX_PATHS_PER_WINDOW: usize = 100;

/// Lets each path through at most once per window, and at most
/// `max` distinct paths per window.
#[derive(Debug)]
pub struct EventLimiter {
    window: Duration,
    max: usize,
    started: Instant,
    seen: HashSet<PathBuf>,
}

impl EventLimiter {
    pub fn new(window: Duration, max: usize, now: Instant) -> Self {
        Self {
            window,
            max,
            started: now,
            seen: HashSet::new(),
        }
    }

    pub fn allow(&mut self, path: &Path, now: Instant) -> bool {
        if now.duration_since(self.started) >= self.window {
            self.started = now;
            self.seen.clear();
        }
        if self.seen.len() >= self.max || self.seen.contains(path) {
            return false;
        }
        self.seen.insert(path.to_path_buf());
        true
    }
}

impl Default for EventLimiter {
    fn default() -> Self {
        Self::new(WINDOW, MAX_PATHS_PER_WINDOW, Instant::now())
    }
}
