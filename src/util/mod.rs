//! Utility module
//!
//! Deadline arithmetic shared by the multicast engine and the timers.

use std::time::Duration;
use tokio::time::Instant;

/// How long a caller is willing to block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Do not block at all
    Immediate,
    /// Block for at most this long
    For(Duration),
    /// Block until something else ends the wait
    Forever,
}

impl From<Duration> for Wait {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Wait::Immediate
        } else {
            Wait::For(duration)
        }
    }
}

/// A fixed point in time computed once as `start + wait`
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    /// Starts the clock now
    pub fn start(wait: Wait) -> Self {
        let now = Instant::now();
        let end = match wait {
            Wait::Immediate => Some(now),
            Wait::For(duration) => Some(now + duration),
            Wait::Forever => None,
        };
        Deadline { end }
    }

    /// Budget left, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.end
            .map(|end| end.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    pub fn instant(&self) -> Option<Instant> {
        self.end
    }
}
