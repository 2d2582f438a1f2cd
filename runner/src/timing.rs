// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::Instant;

/// Logs elapsed time between successive phases of a single request, tagged
/// with its request identifier. The `total` line is emitted on drop so it
/// fires on every exit path, including early returns on error.
pub struct Timing<'a> {
    id: &'a str,
    start: Instant,
    previous: Instant,
}

impl<'a> Timing<'a> {
    pub fn start(id: &'a str) -> Self {
        let now = Instant::now();
        Self {
            id,
            start: now,
            previous: now,
        }
    }

    /// Logs `label` with the elapsed time since the previous mark (or since
    /// `start`, for the first call).
    pub fn mark(&mut self, label: &str) {
        let now = Instant::now();
        log::info!(
            "{} {:.3}s {}",
            self.id,
            now.duration_since(self.previous).as_secs_f64(),
            label
        );
        self.previous = now;
    }
}

impl Drop for Timing<'_> {
    fn drop(&mut self) {
        log::info!(
            "{} {:.3}s {}",
            self.id,
            self.start.elapsed().as_secs_f64(),
            "total"
        );
    }
}
