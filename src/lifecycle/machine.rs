use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::core::{Error, Result};
use super::events::{EventFlags, EventSignal};
use super::status::StatusPattern;

/// Overall device mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Init,
    Disconnected,
    Discovering,
    Running,
    Pairing,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Init => "init",
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Discovering => "discovering",
            LifecycleState::Running => "running",
            LifecycleState::Pairing => "pairing",
        };
        f.write_str(name)
    }
}

/// Side effects the state machine drives on entry and exit
///
/// Server start/stop failures are fatal and terminate the machine. Every
/// other action absorbs its own errors.
pub trait Actions: Send {
    /// One-time initialisation, including restoring persisted state
    fn bring_up(&mut self);
    fn start_server(&mut self) -> Result<()>;
    fn stop_server(&mut self) -> Result<()>;
    /// Kicks off a discovery attempt whose outcome arrives as an event
    fn start_discovery(&mut self);
    fn persist_settings(&mut self);
    fn indicate(&mut self, pattern: StatusPattern);
}

/// Reactive loop owning the device mode
pub struct Lifecycle<A: Actions> {
    actions: A,
    events: Arc<EventSignal>,
    discovery_enabled: bool,
    state: LifecycleState,
    state_tx: watch::Sender<LifecycleState>,
}

impl<A: Actions> Lifecycle<A> {
    pub fn new(actions: A, events: Arc<EventSignal>, discovery_enabled: bool) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Init);
        Lifecycle {
            actions,
            events,
            discovery_enabled,
            state: LifecycleState::Init,
            state_tx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn events(&self) -> &Arc<EventSignal> {
        &self.events
    }

    pub fn actions(&self) -> &A {
        &self.actions
    }

    /// Runs the init entry and moves to `Disconnected`
    pub fn start(&mut self) -> Result<()> {
        if self.state != LifecycleState::Init {
            return Err(Error::invalid_state(format!("lifecycle already started ({})", self.state)));
        }
        info!("Device is starting");
        self.actions.bring_up();
        self.transition(LifecycleState::Disconnected)
    }

    /// Runs the current state's handler against one batch of drained events
    ///
    /// When a transition fires, the bits it did not consume are posted again
    /// so the next state sees them on the following wake.
    pub fn step(&mut self, events: EventFlags) -> Result<()> {
        if self.state == LifecycleState::Init {
            return Err(Error::invalid_state("lifecycle not started"));
        }
        debug!("Lifecycle {} handling {:?}", self.state, events);
        let (next, consumed) = match self.next_state(events) {
            Some(transition) => transition,
            None => return Ok(()),
        };
        self.transition(next)?;

        let leftover = events.without(consumed);
        if !leftover.is_empty() {
            debug!("Lifecycle {} carrying over {:?}", self.state, leftover);
            self.events.post(leftover);
        }
        Ok(())
    }

    /// Drives the machine until a fatal action error terminates it
    pub async fn run(mut self) -> Result<()> {
        self.start()?;
        loop {
            let events = self.events.wait_drain().await;
            if let Err(e) = self.step(events) {
                error!("Lifecycle terminated in state {}: {}", self.state, e);
                return Err(e);
            }
        }
    }

    /// Next state plus the event that triggered it
    fn next_state(&self, events: EventFlags) -> Option<(LifecycleState, EventFlags)> {
        use LifecycleState::*;

        let on = |flag: EventFlags, next: LifecycleState| events.contains(flag).then_some((next, flag));

        match self.state {
            Init => None,
            Disconnected => on(EventFlags::CONNECTED, if self.discovery_enabled { Discovering } else { Running }),
            Discovering => {
                if events.contains(EventFlags::DISCOVERY_FAILED) && !events.contains(EventFlags::DISCOVERY_COMPLETED) {
                    warn!("Discovery failed, returning to disconnected state");
                }
                on(EventFlags::DISCOVERY_COMPLETED, Running)
                    .or_else(|| on(EventFlags::DISCOVERY_FAILED, Disconnected))
                    .or_else(|| on(EventFlags::DISCONNECTED, Disconnected))
            }
            Running => on(EventFlags::PAIRING_REQUESTED, Pairing)
                .or_else(|| on(EventFlags::DISCONNECTED, Disconnected)),
            Pairing => on(EventFlags::PAIRING_ENDED, Running)
                .or_else(|| on(EventFlags::DISCONNECTED, Disconnected)),
        }
    }

    fn transition(&mut self, next: LifecycleState) -> Result<()> {
        self.exit(self.state)?;
        debug!("Lifecycle {} -> {}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.entry(next)
    }

    fn entry(&mut self, state: LifecycleState) -> Result<()> {
        match state {
            LifecycleState::Init => Ok(()),
            LifecycleState::Disconnected => {
                info!("Device is disconnected");
                self.actions.indicate(StatusPattern::SLOW_BLINK);
                self.actions.stop_server()
            }
            LifecycleState::Discovering => {
                info!("Device is discovering server");
                self.actions.indicate(StatusPattern::FAST_BLINK);
                self.actions.start_discovery();
                Ok(())
            }
            LifecycleState::Running => {
                info!("Device is connected");
                self.actions.indicate(StatusPattern::Solid);
                self.actions.start_server()
            }
            LifecycleState::Pairing => {
                info!("Device is in pairing state");
                self.actions.indicate(StatusPattern::PAIRING_BLINK);
                self.actions.start_server()
            }
        }
    }

    fn exit(&mut self, state: LifecycleState) -> Result<()> {
        match state {
            LifecycleState::Running => {
                self.actions.indicate(StatusPattern::Off);
                self.actions.stop_server()
            }
            LifecycleState::Pairing => {
                self.actions.persist_settings();
                self.actions.stop_server()
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use LifecycleState::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
        patterns: Vec<StatusPattern>,
        fail_start: bool,
    }

    impl Actions for Recorder {
        fn bring_up(&mut self) {
            self.calls.push("bring_up");
        }

        fn start_server(&mut self) -> Result<()> {
            self.calls.push("start_server");
            if self.fail_start {
                Err(Error::transport("address in use"))
            } else {
                Ok(())
            }
        }

        fn stop_server(&mut self) -> Result<()> {
            self.calls.push("stop_server");
            Ok(())
        }

        fn start_discovery(&mut self) {
            self.calls.push("start_discovery");
        }

        fn persist_settings(&mut self) {
            self.calls.push("persist_settings");
        }

        fn indicate(&mut self, pattern: StatusPattern) {
            self.patterns.push(pattern);
        }
    }

    fn machine(discovery: bool) -> Lifecycle<Recorder> {
        let mut machine = Lifecycle::new(Recorder::default(), Arc::new(EventSignal::new()), discovery);
        machine.start().unwrap();
        machine
    }

    #[test]
    fn test_full_scenario() {
        let mut machine = machine(true);
        assert_eq!(machine.state(), Disconnected);
        assert_eq!(machine.actions().patterns, vec![StatusPattern::SLOW_BLINK]);

        machine.step(EventFlags::CONNECTED).unwrap();
        assert_eq!(machine.state(), Discovering);
        assert!(machine.actions().calls.contains(&"start_discovery"));

        machine.step(EventFlags::DISCOVERY_COMPLETED).unwrap();
        assert_eq!(machine.state(), Running);

        machine.step(EventFlags::PAIRING_REQUESTED).unwrap();
        assert_eq!(machine.state(), Pairing);

        machine.step(EventFlags::PAIRING_ENDED).unwrap();
        assert_eq!(machine.state(), Running);

        assert_eq!(
            machine.actions().calls,
            vec![
                "bring_up",
                "stop_server",
                "start_discovery",
                "start_server",
                "stop_server",
                "start_server",
                "persist_settings",
                "stop_server",
                "start_server",
            ]
        );
    }

    #[test]
    fn test_disconnect_from_every_connected_state() {
        for path in [
            vec![EventFlags::CONNECTED],
            vec![EventFlags::CONNECTED, EventFlags::DISCOVERY_COMPLETED],
            vec![EventFlags::CONNECTED, EventFlags::DISCOVERY_COMPLETED, EventFlags::PAIRING_REQUESTED],
        ] {
            let mut machine = machine(true);
            for event in path {
                machine.step(event).unwrap();
            }
            assert_ne!(machine.state(), Disconnected);
            machine.step(EventFlags::DISCONNECTED).unwrap();
            assert_eq!(machine.state(), Disconnected);
        }
    }

    #[test]
    fn test_discovery_failure_and_skip() {
        let mut machine = machine(true);
        machine.step(EventFlags::CONNECTED).unwrap();
        machine.step(EventFlags::DISCOVERY_FAILED).unwrap();
        assert_eq!(machine.state(), Disconnected);

        let mut machine = self::machine(false);
        machine.step(EventFlags::CONNECTED).unwrap();
        assert_eq!(machine.state(), Running);
        assert!(!machine.actions().calls.contains(&"start_discovery"));
    }

    #[test]
    fn test_irrelevant_events_ignored() {
        let mut machine = machine(true);
        machine.step(EventFlags::PAIRING_REQUESTED | EventFlags::DISCOVERY_COMPLETED).unwrap();
        assert_eq!(machine.state(), Disconnected);

        machine.step(EventFlags::CONNECTED).unwrap();
        machine.step(EventFlags::DISCOVERY_COMPLETED).unwrap();
        assert!(machine.events().try_drain().is_empty());
    }

    #[test]
    fn test_pairing_round_in_one_wake_returns_to_running() {
        let mut machine = machine(false);
        machine.step(EventFlags::CONNECTED).unwrap();
        assert_eq!(machine.state(), Running);

        machine.step(EventFlags::PAIRING_REQUESTED | EventFlags::PAIRING_ENDED).unwrap();
        assert_eq!(machine.state(), Pairing);

        let carried = machine.events().try_drain();
        assert_eq!(carried, EventFlags::PAIRING_ENDED);
        machine.step(carried).unwrap();
        assert_eq!(machine.state(), Running);
        assert!(machine.actions().calls.contains(&"persist_settings"));
        assert!(machine.events().try_drain().is_empty());
    }

    #[test]
    fn test_disconnect_survives_pairing_request_in_same_wake() {
        let mut machine = machine(false);
        machine.step(EventFlags::CONNECTED).unwrap();

        // pairing wins the wake, the disconnect is handled on the next one
        machine.step(EventFlags::PAIRING_REQUESTED | EventFlags::DISCONNECTED).unwrap();
        assert_eq!(machine.state(), Pairing);

        let carried = machine.events().try_drain();
        assert_eq!(carried, EventFlags::DISCONNECTED);
        machine.step(carried).unwrap();
        assert_eq!(machine.state(), Disconnected);
    }

    #[test]
    fn test_unused_bits_dropped_without_transition() {
        let mut machine = machine(true);
        machine.step(EventFlags::CONNECTED | EventFlags::PAIRING_ENDED).unwrap();
        assert_eq!(machine.state(), Discovering);

        // nothing in Discovering consumes it
        let carried = machine.events().try_drain();
        machine.step(carried).unwrap();
        assert_eq!(machine.state(), Discovering);
        assert!(machine.events().try_drain().is_empty());
    }

    #[test]
    fn test_step_before_start() {
        let mut machine = Lifecycle::new(Recorder::default(), Arc::new(EventSignal::new()), true);
        assert!(matches!(machine.step(EventFlags::CONNECTED), Err(Error::InvalidState(_))));
        machine.start().unwrap();
        assert!(machine.start().is_err());
    }

    #[tokio::test]
    async fn test_server_failure_terminates() {
        let actions = Recorder {
            fail_start: true,
            ..Default::default()
        };
        let events = Arc::new(EventSignal::new());
        let machine = Lifecycle::new(actions, Arc::clone(&events), false);
        let mut states = machine.subscribe();

        let running = tokio::spawn(machine.run());
        events.post(EventFlags::CONNECTED);

        let result = tokio::time::timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(*states.borrow_and_update(), Running);
    }

    #[tokio::test]
    async fn test_run_loop_follows_posted_events() {
        let events = Arc::new(EventSignal::new());
        let machine = Lifecycle::new(Recorder::default(), Arc::clone(&events), true);
        let mut states = machine.subscribe();
        let running = tokio::spawn(machine.run());

        states.wait_for(|s| *s == Disconnected).await.unwrap();
        events.post(EventFlags::CONNECTED);
        states.wait_for(|s| *s == Discovering).await.unwrap();
        events.post(EventFlags::DISCOVERY_COMPLETED);
        states.wait_for(|s| *s == Running).await.unwrap();

        running.abort();
    }

    #[tokio::test]
    async fn test_run_loop_handles_combined_wakes() {
        let events = Arc::new(EventSignal::new());
        let machine = Lifecycle::new(Recorder::default(), Arc::clone(&events), false);
        let mut states = machine.subscribe();
        let running = tokio::spawn(machine.run());

        states.wait_for(|s| *s == Disconnected).await.unwrap();
        events.post(EventFlags::CONNECTED);
        states.wait_for(|s| *s == Running).await.unwrap();

        events.post(EventFlags::PAIRING_REQUESTED | EventFlags::DISCONNECTED);
        let reached = tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| *s == Disconnected))
            .await
            .map(|r| r.is_ok());
        assert_eq!(reached, Ok(true));

        running.abort();
    }
}
