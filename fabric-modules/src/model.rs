//! Shared data model: the types every component passes around.

use std::collections::HashMap;

use fabric_arch::ids::{EndpointId, ParticipantId};
use serde::{Deserialize, Serialize};

/// Ordered lifecycle states. Order matters: the system-state reducer takes
/// the minimum of the required participants' states along this pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParticipantState {
    Invalid,
    ServicesCreated,
    CommunicationInitializing,
    CommunicationInitialized,
    ReadyToRun,
    Running,
    Paused,
    Stopping,
    Stopped,
    ShuttingDown,
    Shutdown,
    Error,
    Aborting,
}

impl ParticipantState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ParticipantState::Shutdown | ParticipantState::Error)
    }
}

impl std::fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Same label set as [`ParticipantState`]; a value derived by the reducer.
pub type SystemState = ParticipantState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantStatus {
    pub participant_name: String,
    pub state: ParticipantState,
    pub enter_reason: String,
    /// Wall-clock milliseconds.
    pub enter_timestamp: i64,
    pub refresh_timestamp: i64,
}

/// Named virtual wire type. Controllers on different network types never
/// exchange messages even if the network name collides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    Undefined,
    Can,
    Ethernet,
    FlexRay,
    Lin,
    Data,
    Rpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    Link,
    Controller,
    InternalController,
    SimulatedController,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub participant_name: String,
    pub service_name: String,
    pub service_type: ServiceType,
    pub network_name: String,
    pub network_type: NetworkType,
    pub service_id: EndpointId,
    pub supplemental: HashMap<String, String>,
}

impl ServiceDescriptor {
    /// Services are uniquely identified by (network name, service id) within
    /// a participant.
    pub fn local_key(&self) -> (String, EndpointId) {
        (self.network_name.clone(), self.service_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct ListenEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A connected remote participant, as tracked by the router/registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub participant_name: String,
    pub participant_id: ParticipantId,
    pub endpoints: Vec<ListenEndpoint>,
    /// (network name, endpoint id) keys this peer has subscribed to.
    pub subscriptions: Vec<(String, EndpointId)>,
}

/// The ordered set of participant names required for the system-state
/// reducer. Set once by the system controller, broadcast to all monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkflowConfiguration {
    pub required_participants: Vec<String>,
}

/// A participant's announcement of the next simulation step it intends to
/// execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextSimTask {
    /// Virtual-time point, nanoseconds.
    pub time_point: i64,
    /// Step duration, nanoseconds.
    pub duration: i64,
}

impl NextSimTask {
    pub fn end(&self) -> i64 {
        self.time_point + self.duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceDiscoveryEventType {
    ServiceCreated,
    ServiceRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDiscoveryEvent {
    pub event_type: ServiceDiscoveryEventType,
    pub descriptor: ServiceDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemCommand {
    Run,
    Stop,
    AbortSimulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantCommand {
    Shutdown,
    Restart,
}
