use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

/// Set of lifecycle events, one bit each
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const NONE: EventFlags = EventFlags(0);
    pub const CONNECTED: EventFlags = EventFlags(1 << 0);
    pub const DISCONNECTED: EventFlags = EventFlags(1 << 1);
    pub const DISCOVERY_COMPLETED: EventFlags = EventFlags(1 << 2);
    pub const DISCOVERY_FAILED: EventFlags = EventFlags(1 << 3);
    pub const PAIRING_REQUESTED: EventFlags = EventFlags(1 << 4);
    pub const PAIRING_ENDED: EventFlags = EventFlags(1 << 5);

    const NAMES: [(EventFlags, &'static str); 6] = [
        (EventFlags::CONNECTED, "CONNECTED"),
        (EventFlags::DISCONNECTED, "DISCONNECTED"),
        (EventFlags::DISCOVERY_COMPLETED, "DISCOVERY_COMPLETED"),
        (EventFlags::DISCOVERY_FAILED, "DISCOVERY_FAILED"),
        (EventFlags::PAIRING_REQUESTED, "PAIRING_REQUESTED"),
        (EventFlags::PAIRING_ENDED, "PAIRING_ENDED"),
    ];

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        EventFlags(bits)
    }

    pub fn contains(&self, other: EventFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Bits of `self` not set in `other`
    pub fn without(&self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 & !other.0)
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "EventFlags({})", names.join(" | "))
    }
}

/// Multi-producer event object feeding the lifecycle loop
///
/// Posting never blocks. The single consumer takes every pending bit at once.
#[derive(Default)]
pub struct EventSignal {
    pending: AtomicU32,
    notify: Notify,
}

impl EventSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, events: EventFlags) {
        if events.is_empty() {
            return;
        }
        self.pending.fetch_or(events.bits(), Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Takes all pending events without waiting
    pub fn try_drain(&self) -> EventFlags {
        EventFlags(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Waits until at least one event is pending, then takes them all
    pub async fn wait_drain(&self) -> EventFlags {
        loop {
            let events = self.try_drain();
            if !events.is_empty() {
                return events;
            }
            self.notify.notified().await;
        }
    }
}
