//! Wall-clock timing for jobs, stages and runs.

use std::time::{Duration, Instant};

/// Measures the time since it was started.
#[derive(Debug, Clone)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Milliseconds elapsed so far.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// The timer's label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the timer and returns the elapsed time.
    #[must_use]
    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::trace!(span = %self.name, elapsed_ms = self.elapsed_ms(), "timer finished");
        elapsed
    }
}
