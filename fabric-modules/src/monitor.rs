//! System monitor / reducer (component G): folds every required
//! participant's reported [`ParticipantStatus`] into one aggregate
//! [`SystemState`].

use std::collections::HashMap;

use fabric_arch::broker::{Broker, Subsystem, SubsystemHandler};
use fabric_arch::platform_async_trait;

use crate::model::{ParticipantState, ParticipantStatus, SystemState, WorkflowConfiguration};

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorIn {
    WorkflowConfiguration(WorkflowConfiguration),
    ParticipantStatus(ParticipantStatus),
    ParticipantDisconnected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOut {
    SystemStateChanged(SystemState),
}

pub struct Monitor {
    required: Vec<String>,
    states: HashMap<String, ParticipantState>,
    current: Option<SystemState>,
    invalid_transitions: u64,
}

impl Monitor {
    pub fn new() -> Self {
        Monitor {
            required: Vec::new(),
            states: HashMap::new(),
            current: None,
            invalid_transitions: 0,
        }
    }

    pub async fn start() -> anyhow::Result<Broker<MonitorIn, MonitorOut>> {
        let mut broker = Broker::new();
        broker
            .add_subsystem(Subsystem::Handler(Box::new(Monitor::new())))
            .await?;
        Ok(broker)
    }

    pub fn system_state(&self) -> Option<SystemState> {
        self.current
    }

    pub fn invalid_transition_count(&self) -> u64 {
        self.invalid_transitions
    }

    fn is_declared_transition(from: ParticipantState, to: ParticipantState) -> bool {
        use ParticipantState::*;
        matches!(
            (from, to),
            (Invalid, ServicesCreated)
                | (ServicesCreated, CommunicationInitializing)
                | (CommunicationInitializing, CommunicationInitialized)
                | (CommunicationInitialized, ReadyToRun)
                | (ReadyToRun, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopping)
                | (Paused, Stopping)
                | (Stopping, Stopped)
                | (Stopped, ShuttingDown)
                | (ShuttingDown, Shutdown)
                | (_, Aborting)
                | (Aborting, Shutdown)
                | (_, Error)
        )
    }

    fn reduce(&self) -> Option<SystemState> {
        if self.required.is_empty() {
            return None;
        }
        let mut observed = Vec::with_capacity(self.required.len());
        for name in &self.required {
            observed.push(
                self.states
                    .get(name)
                    .copied()
                    .unwrap_or(ParticipantState::Invalid),
            );
        }

        if observed.iter().any(|s| *s == ParticipantState::Error) {
            return Some(ParticipantState::Error);
        }
        if observed
            .iter()
            .any(|s| *s == ParticipantState::Aborting)
            && !observed.iter().all(|s| s.is_terminal())
        {
            return Some(ParticipantState::Aborting);
        }
        if observed
            .iter()
            .any(|s| *s == ParticipantState::ShuttingDown)
            && !observed.iter().all(|s| s.is_terminal())
        {
            return Some(ParticipantState::ShuttingDown);
        }
        if observed.iter().any(|s| *s == ParticipantState::Paused)
            && observed
                .iter()
                .all(|s| matches!(s, ParticipantState::Running | ParticipantState::Paused))
        {
            return Some(ParticipantState::Paused);
        }
        observed.iter().copied().min()
    }

    fn handle(&mut self, msg: MonitorIn) -> Vec<MonitorOut> {
        match msg {
            MonitorIn::WorkflowConfiguration(cfg) => {
                self.required = cfg.required_participants;
            }
            MonitorIn::ParticipantStatus(status) => {
                let prior = self
                    .states
                    .get(&status.participant_name)
                    .copied()
                    .unwrap_or(ParticipantState::Invalid);
                if prior != status.state && !Self::is_declared_transition(prior, status.state) {
                    self.invalid_transitions += 1;
                    log::warn!(
                        "invalid participant transition for '{}': {prior} -> {}",
                        status.participant_name,
                        status.state
                    );
                }
                self.states
                    .insert(status.participant_name, status.state);
            }
            MonitorIn::ParticipantDisconnected(name) => {
                self.states.remove(&name);
            }
        }

        let next = self.reduce();
        if next.is_some() && next != self.current {
            self.current = next;
            vec![MonitorOut::SystemStateChanged(next.unwrap())]
        } else {
            vec![]
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

#[platform_async_trait()]
impl SubsystemHandler<MonitorIn, MonitorOut> for Monitor {
    async fn messages(&mut self, from_broker: Vec<MonitorIn>) -> Vec<MonitorOut> {
        from_broker
            .into_iter()
            .flat_map(|msg| self.handle(msg))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, state: ParticipantState) -> ParticipantStatus {
        ParticipantStatus {
            participant_name: name.to_string(),
            state,
            enter_reason: "test".into(),
            enter_timestamp: 0,
            refresh_timestamp: 0,
        }
    }

    fn with_two_required() -> Monitor {
        let mut m = Monitor::new();
        m.handle(MonitorIn::WorkflowConfiguration(WorkflowConfiguration {
            required_participants: vec!["ECU1".into(), "ECU2".into()],
        }));
        m
    }

    #[test]
    fn system_state_is_minimum_of_participants() {
        let mut m = with_two_required();
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU1",
            ParticipantState::Running,
        )));
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU2",
            ParticipantState::ReadyToRun,
        )));
        assert_eq!(m.system_state(), Some(ParticipantState::ReadyToRun));
    }

    #[test]
    fn error_dominates() {
        let mut m = with_two_required();
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU1",
            ParticipantState::Running,
        )));
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU2",
            ParticipantState::Error,
        )));
        assert_eq!(m.system_state(), Some(ParticipantState::Error));
    }

    #[test]
    fn pause_is_sticky_while_others_run() {
        let mut m = with_two_required();
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU1",
            ParticipantState::Running,
        )));
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU2",
            ParticipantState::Paused,
        )));
        assert_eq!(m.system_state(), Some(ParticipantState::Paused));
    }

    #[test]
    fn invalid_transition_is_recorded_but_not_rejected() {
        let mut m = with_two_required();
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU1",
            ParticipantState::Running,
        )));
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU2",
            ParticipantState::Running,
        )));
        assert_eq!(m.invalid_transition_count(), 1);
        assert_eq!(m.states.get("ECU2"), Some(&ParticipantState::Running));
    }

    #[test]
    fn late_joiner_holds_aggregate_at_invalid() {
        let mut m = with_two_required();
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU1",
            ParticipantState::Running,
        )));
        assert_eq!(m.system_state(), Some(ParticipantState::Invalid));
    }

    #[test]
    fn disconnect_removes_participant_from_reduction() {
        let mut m = with_two_required();
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU1",
            ParticipantState::Running,
        )));
        m.handle(MonitorIn::ParticipantStatus(status(
            "ECU2",
            ParticipantState::Running,
        )));
        m.handle(MonitorIn::ParticipantDisconnected("ECU2".into()));
        assert_eq!(m.system_state(), Some(ParticipantState::Invalid));
    }
}
