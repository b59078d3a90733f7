//! System controller (component H): a thin command sender. It owns no
//! state of its own - every call just shapes a message for the transport
//! layer to broadcast or unicast.

use crate::model::{ParticipantCommand, SystemCommand, WorkflowConfiguration};

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerOut {
    Broadcast(SystemCommand),
    Unicast(String, ParticipantCommand),
    BroadcastWorkflowConfiguration(WorkflowConfiguration),
}

/// Stateless by design: every method is a pure translation from an intent to
/// the message that expresses it. Kept as a type (rather than bare
/// functions) so it reads the same way as the other components at the call
/// site.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemController;

impl SystemController {
    pub fn run(&self) -> ControllerOut {
        ControllerOut::Broadcast(SystemCommand::Run)
    }

    pub fn stop(&self) -> ControllerOut {
        ControllerOut::Broadcast(SystemCommand::Stop)
    }

    pub fn shutdown(&self, participant_name: &str) -> ControllerOut {
        ControllerOut::Unicast(participant_name.to_string(), ParticipantCommand::Shutdown)
    }

    pub fn abort_simulation(&self) -> ControllerOut {
        ControllerOut::Broadcast(SystemCommand::AbortSimulation)
    }

    pub fn set_workflow_configuration(&self, required_participants: Vec<String>) -> ControllerOut {
        ControllerOut::BroadcastWorkflowConfiguration(WorkflowConfiguration {
            required_participants,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_broadcasts_system_command() {
        let c = SystemController;
        assert_eq!(c.run(), ControllerOut::Broadcast(SystemCommand::Run));
    }

    #[test]
    fn shutdown_unicasts_to_named_participant() {
        let c = SystemController;
        assert_eq!(
            c.shutdown("ECU1"),
            ControllerOut::Unicast("ECU1".into(), ParticipantCommand::Shutdown)
        );
    }

    #[test]
    fn set_workflow_configuration_wraps_names() {
        let c = SystemController;
        let out = c.set_workflow_configuration(vec!["ECU1".into(), "ECU2".into()]);
        assert_eq!(
            out,
            ControllerOut::BroadcastWorkflowConfiguration(WorkflowConfiguration {
                required_participants: vec!["ECU1".into(), "ECU2".into()]
            })
        );
    }
}
