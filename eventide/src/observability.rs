//! Observability utilities.
//!
//! The runtime logs through the `tracing` facade: rendezvous and commit
//! points at trace level, suppressed cleanup panics at warn level. This
//! module wires a default subscriber for binaries and tests that want
//! the output without configuring `tracing-subscriber` themselves.

use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs a global env-filtered subscriber.
///
/// Filtering follows `RUST_LOG`, defaulting to `warn` for this crate's
/// noise level. Panics if a global subscriber is already set; use
/// [`try_init_tracing`] when that is expected.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}

/// Installs a global env-filtered subscriber, ignoring an already-set
/// subscriber.
pub fn try_init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();
}

/// Simple wall-clock timer for instrumenting synchronization latency.
#[derive(Debug)]
pub struct SyncTimer {
    start: Instant,
    name: String,
}

impl SyncTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the timer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the timer, emitting the duration at trace level.
    pub fn finish(self) -> f64 {
        let elapsed = self.elapsed_ms();
        tracing::trace!(name = %self.name, elapsed_ms = elapsed, "sync timing");
        elapsed
    }
}
