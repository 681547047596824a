use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

/// What the status LED shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPattern {
    Off,
    Solid,
    Blink { on: Duration, off: Duration },
}

impl StatusPattern {
    /// Waiting for the network
    pub const SLOW_BLINK: StatusPattern = StatusPattern::blink(500, 500);
    /// Looking for the discovery server
    pub const FAST_BLINK: StatusPattern = StatusPattern::blink(250, 250);
    /// Pairing window open
    pub const PAIRING_BLINK: StatusPattern = StatusPattern::blink(800, 200);

    pub const fn blink(on_ms: u64, off_ms: u64) -> Self {
        StatusPattern::Blink {
            on: Duration::from_millis(on_ms),
            off: Duration::from_millis(off_ms),
        }
    }
}

pub trait StatusIndicator: Send + Sync {
    fn apply(&self, pattern: StatusPattern);
}

/// Reports pattern changes through the log
#[derive(Debug, Default)]
pub struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn apply(&self, pattern: StatusPattern) {
        info!("Status indicator: {:?}", pattern);
    }
}

/// Remembers every pattern applied
#[derive(Debug, Default)]
pub struct RecordingIndicator {
    history: Mutex<Vec<StatusPattern>>,
}

impl RecordingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<StatusPattern> {
        self.history.lock().last().copied()
    }

    pub fn history(&self) -> Vec<StatusPattern> {
        self.history.lock().clone()
    }
}

impl StatusIndicator for RecordingIndicator {
    fn apply(&self, pattern: StatusPattern) {
        self.history.lock().push(pattern);
    }
}
