//! Optional command timing hook.

use std::time::Duration;

/// Receives one duration sample per dispatched command.
///
/// Injected by the embedding application; the default implementation
/// discards samples, so an absent timer is never an error.
pub trait CommandTimer: Send + Sync {
    fn record(&self, duration: Duration);
}

/// Default timer. Recording is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTimer;

impl CommandTimer for NoopTimer {
    fn record(&self, _duration: Duration) {}
}
