//! Lifecycle module
//!
//! Event flags posted by the other components, the status indicator, and
//! the state machine sequencing connection, discovery, running and pairing.

mod events;
mod machine;
mod status;

pub use self::events::{EventFlags, EventSignal};
pub use self::machine::{Actions, Lifecycle, LifecycleState};
pub use self::status::{LogIndicator, RecordingIndicator, StatusIndicator, StatusPattern};
