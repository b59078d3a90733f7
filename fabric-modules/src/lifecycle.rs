//! Per-participant lifecycle FSM (component F).
//!
//! One `Lifecycle` per participant. Driven by `LifecycleIn` events coming
//! from the system monitor (aggregate system-state changes), the system
//! controller (`SystemCommand`/`ParticipantCommand`), and the handler
//! invocations the FSM itself requests of the embedding participant.

use fabric_arch::broker::{Broker, Subsystem, SubsystemHandler};
use fabric_arch::platform_async_trait;

use crate::model::{ParticipantCommand, ParticipantState, SystemCommand, SystemState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub coordinated_start: bool,
    pub coordinated_stop: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            coordinated_start: true,
            coordinated_stop: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleIn {
    /// The embedding participant has finished creating its services;
    /// enters the FSM at `ServicesCreated`.
    Start,
    /// The aggregate system state has advanced (relevant to coordinated
    /// participants waiting on it).
    SystemStateChanged(SystemState),
    Command(SystemCommand),
    ParticipantCommand(ParticipantCommand),
    /// The user's communication-ready callback returned.
    CommReadyHandlerDone,
    /// The user's starting-handler returned (uncoordinated/unsynced path).
    StartingHandlerDone,
    /// The user's stop-handler returned.
    StopHandlerDone,
    /// The user's shutdown-handler returned.
    ShutdownHandlerDone,
    /// A registered handler panicked or returned an error.
    HandlerFailed,
    Pause,
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOut {
    StateChanged(ParticipantState),
    InvokeCommReadyHandler,
    InvokeStartingHandler,
    InvokeStopHandler,
    InvokeShutdownHandler,
    /// Logged, non-fatal: a transition outside the declared table was
    /// requested and ignored.
    InvalidTransitionIgnored(ParticipantState, &'static str),
}

pub struct Lifecycle {
    config: LifecycleConfig,
    state: ParticipantState,
}

impl Lifecycle {
    pub fn new(config: LifecycleConfig) -> Self {
        Lifecycle {
            config,
            state: ParticipantState::Invalid,
        }
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub async fn start(config: LifecycleConfig) -> anyhow::Result<Broker<LifecycleIn, LifecycleOut>> {
        let mut broker = Broker::new();
        broker
            .add_subsystem(Subsystem::Handler(Box::new(Lifecycle::new(config))))
            .await?;
        Ok(broker)
    }

    fn transition(&mut self, to: ParticipantState) -> LifecycleOut {
        self.state = to;
        LifecycleOut::StateChanged(to)
    }

    fn invalid(&self, reason: &'static str) -> LifecycleOut {
        LifecycleOut::InvalidTransitionIgnored(self.state, reason)
    }

    fn handle(&mut self, msg: LifecycleIn) -> Vec<LifecycleOut> {
        use ParticipantState::*;

        match msg {
            LifecycleIn::Start => {
                if self.state != Invalid {
                    return vec![self.invalid("Start issued after Invalid")];
                }
                let mut out = vec![self.transition(ServicesCreated)];
                if !self.config.coordinated_start {
                    out.push(self.transition(CommunicationInitializing));
                    out.push(LifecycleOut::InvokeCommReadyHandler);
                }
                out
            }
            LifecycleIn::SystemStateChanged(sys) => {
                if !self.config.coordinated_start && self.state < ReadyToRun {
                    return vec![];
                }
                match self.state {
                    // Every required participant has at least created its
                    // services; safe for this one to start initializing
                    // communication.
                    ServicesCreated if sys >= ServicesCreated => {
                        let mut out = vec![self.transition(CommunicationInitializing)];
                        out.push(self.transition(CommunicationInitialized));
                        out.push(LifecycleOut::InvokeCommReadyHandler);
                        out
                    }
                    _ => vec![],
                }
            }
            LifecycleIn::CommReadyHandlerDone => {
                if self.state != CommunicationInitialized {
                    return vec![self.invalid("CommReadyHandlerDone outside CommunicationInitialized")];
                }
                vec![self.transition(ReadyToRun)]
            }
            LifecycleIn::Command(SystemCommand::Run) => {
                if self.state != ReadyToRun {
                    return vec![self.invalid("Run issued before ReadyToRun")];
                }
                let mut out = vec![LifecycleOut::InvokeStartingHandler];
                out.push(self.transition(Running));
                out
            }
            LifecycleIn::StartingHandlerDone => vec![],
            LifecycleIn::Pause => {
                if self.state != Running {
                    return vec![self.invalid("Pause issued outside Running")];
                }
                vec![self.transition(Paused)]
            }
            LifecycleIn::Continue => {
                if self.state != Paused {
                    return vec![self.invalid("Continue issued outside Paused")];
                }
                vec![self.transition(Running)]
            }
            LifecycleIn::Command(SystemCommand::Stop) => {
                if self.state != Running && self.state != Paused {
                    return vec![self.invalid("Stop issued outside Running/Paused")];
                }
                let mut out = vec![self.transition(Stopping), LifecycleOut::InvokeStopHandler];
                if !self.config.coordinated_stop {
                    out.push(self.transition(Stopped));
                    out.push(self.transition(ShuttingDown));
                    out.push(LifecycleOut::InvokeShutdownHandler);
                }
                out
            }
            LifecycleIn::StopHandlerDone => {
                if self.state != Stopping {
                    return vec![self.invalid("StopHandlerDone outside Stopping")];
                }
                vec![self.transition(Stopped)]
            }
            LifecycleIn::Command(SystemCommand::AbortSimulation) | LifecycleIn::Abort => {
                vec![self.transition(Aborting)]
            }
            LifecycleIn::ParticipantCommand(ParticipantCommand::Shutdown) => {
                if self.state != Stopped && self.state != Aborting {
                    return vec![self.invalid("Shutdown issued before Stopped")];
                }
                vec![
                    self.transition(ShuttingDown),
                    LifecycleOut::InvokeShutdownHandler,
                ]
            }
            LifecycleIn::ParticipantCommand(ParticipantCommand::Restart) => {
                if self.state != Error {
                    return vec![self.invalid("Restart accepted only from Error")];
                }
                vec![self.transition(ServicesCreated)]
            }
            LifecycleIn::ShutdownHandlerDone => {
                // Terminal wins even if the handler reported failure upstream.
                vec![self.transition(Shutdown)]
            }
            LifecycleIn::HandlerFailed => {
                if self.state == ShuttingDown {
                    return vec![self.transition(Shutdown)];
                }
                vec![self.transition(Error)]
            }
        }
    }
}

#[platform_async_trait()]
impl SubsystemHandler<LifecycleIn, LifecycleOut> for Lifecycle {
    async fn messages(&mut self, from_broker: Vec<LifecycleIn>) -> Vec<LifecycleOut> {
        from_broker
            .into_iter()
            .flat_map(|msg| self.handle(msg))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinated() -> Lifecycle {
        Lifecycle::new(LifecycleConfig {
            coordinated_start: true,
            coordinated_stop: true,
        })
    }

    #[test]
    fn happy_path_to_running() {
        let mut l = coordinated();
        l.handle(LifecycleIn::Start);
        assert_eq!(l.state(), ParticipantState::ServicesCreated);
        l.handle(LifecycleIn::SystemStateChanged(ParticipantState::CommunicationInitializing));
        assert_eq!(l.state(), ParticipantState::CommunicationInitialized);
        l.handle(LifecycleIn::CommReadyHandlerDone);
        assert_eq!(l.state(), ParticipantState::ReadyToRun);
        l.handle(LifecycleIn::Command(SystemCommand::Run));
        assert_eq!(l.state(), ParticipantState::Running);
    }

    #[test]
    fn uncoordinated_start_skips_straight_to_comm_initializing() {
        let mut l = Lifecycle::new(LifecycleConfig {
            coordinated_start: false,
            coordinated_stop: true,
        });
        l.handle(LifecycleIn::Start);
        assert_eq!(l.state(), ParticipantState::CommunicationInitializing);
    }

    #[test]
    fn uncoordinated_stop_goes_straight_to_shutdown() {
        let mut l = Lifecycle::new(LifecycleConfig {
            coordinated_start: true,
            coordinated_stop: false,
        });
        l.handle(LifecycleIn::Start);
        l.handle(LifecycleIn::SystemStateChanged(ParticipantState::CommunicationInitializing));
        l.handle(LifecycleIn::CommReadyHandlerDone);
        l.handle(LifecycleIn::Command(SystemCommand::Run));
        let out = l.handle(LifecycleIn::Command(SystemCommand::Stop));
        assert_eq!(l.state(), ParticipantState::ShuttingDown);
        assert!(out.contains(&LifecycleOut::InvokeShutdownHandler));
    }

    #[test]
    fn run_before_ready_is_ignored_not_fatal() {
        let mut l = coordinated();
        let out = l.handle(LifecycleIn::Command(SystemCommand::Run));
        assert_eq!(l.state(), ParticipantState::Invalid);
        assert!(matches!(out[0], LifecycleOut::InvalidTransitionIgnored(..)));
    }

    #[test]
    fn shutdown_handler_failure_still_reaches_shutdown() {
        let mut l = coordinated();
        l.handle(LifecycleIn::Start);
        l.handle(LifecycleIn::SystemStateChanged(ParticipantState::CommunicationInitializing));
        l.handle(LifecycleIn::CommReadyHandlerDone);
        l.handle(LifecycleIn::Command(SystemCommand::Run));
        l.handle(LifecycleIn::Command(SystemCommand::Stop));
        l.handle(LifecycleIn::StopHandlerDone);
        l.handle(LifecycleIn::ParticipantCommand(ParticipantCommand::Shutdown));
        let out = l.handle(LifecycleIn::HandlerFailed);
        assert_eq!(l.state(), ParticipantState::Shutdown);
        assert!(out.contains(&LifecycleOut::StateChanged(ParticipantState::Shutdown)));
    }

    #[test]
    fn abort_from_any_state_reaches_aborting() {
        let mut l = coordinated();
        l.handle(LifecycleIn::Start);
        let out = l.handle(LifecycleIn::Abort);
        assert_eq!(l.state(), ParticipantState::Aborting);
        assert!(out.contains(&LifecycleOut::StateChanged(ParticipantState::Aborting)));
    }

    #[test]
    fn restart_only_accepted_from_error() {
        let mut l = coordinated();
        l.handle(LifecycleIn::Start);
        l.handle(LifecycleIn::HandlerFailed);
        assert_eq!(l.state(), ParticipantState::Error);
        l.handle(LifecycleIn::ParticipantCommand(ParticipantCommand::Restart));
        assert_eq!(l.state(), ParticipantState::ServicesCreated);
    }
}
