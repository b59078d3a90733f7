//! Service discovery (component E): a replicated view of every controller's
//! [`ServiceDescriptor`] across the domain.
//!
//! `Discovery` is a plain [`SubsystemHandler`]; registration with replay
//! semantics (`RegisterServiceDiscoveryHandler`) is a caller-side pattern
//! rather than something the broker does for you: take a tap with
//! [`fabric_arch::broker::Broker::get_tap_out`] first, then send
//! [`DiscoveryIn::Snapshot`] - the snapshot and every later event arrive on
//! the same tap in order, so nothing in between is missed. A "specific"
//! handler is just a snapshot/event stream filtered by the caller.

use std::collections::HashMap;

use fabric_arch::broker::{Broker, Subsystem, SubsystemHandler};
use fabric_arch::ids::ParticipantId;
use fabric_arch::platform_async_trait;

use crate::model::{ServiceDescriptor, ServiceDiscoveryEventType};

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryIn {
    LocalServiceCreated(ServiceDescriptor),
    LocalServiceRemoved(ServiceDescriptor),
    PeerConnected(ParticipantId, String),
    PeerDisconnected(ParticipantId),
    PeerEvent(ServiceDiscoveryEventType, ServiceDescriptor),
    /// Request a replay of every currently-known descriptor.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryOut {
    /// A create/remove event, for every locally registered handler.
    Event(ServiceDiscoveryEventType, ServiceDescriptor),
    /// Reply to [`DiscoveryIn::Snapshot`].
    Snapshot(Vec<ServiceDescriptor>),
    /// Ship an event out to one connected peer.
    SendToPeer(ParticipantId, ServiceDiscoveryEventType, ServiceDescriptor),
}

pub struct Discovery {
    own_name: String,
    /// participant name -> its known descriptors (including our own, under
    /// `own_name`).
    by_participant: HashMap<String, Vec<ServiceDescriptor>>,
    peer_names: HashMap<ParticipantId, String>,
}

impl Discovery {
    pub fn new(own_name: &str) -> Self {
        Discovery {
            own_name: own_name.to_string(),
            by_participant: HashMap::new(),
            peer_names: HashMap::new(),
        }
    }

    pub async fn start(own_name: &str) -> anyhow::Result<Broker<DiscoveryIn, DiscoveryOut>> {
        let mut broker = Broker::new();
        broker
            .add_subsystem(Subsystem::Handler(Box::new(Discovery::new(own_name))))
            .await?;
        Ok(broker)
    }

    fn own_descriptors(&self) -> Vec<ServiceDescriptor> {
        self.by_participant
            .get(&self.own_name)
            .cloned()
            .unwrap_or_default()
    }

    fn connected_peers(&self) -> Vec<ParticipantId> {
        self.peer_names.keys().copied().collect()
    }

    fn handle(&mut self, msg: DiscoveryIn) -> Vec<DiscoveryOut> {
        match msg {
            DiscoveryIn::LocalServiceCreated(descriptor) => {
                self.by_participant
                    .entry(self.own_name.clone())
                    .or_default()
                    .push(descriptor.clone());
                let mut out = vec![DiscoveryOut::Event(
                    ServiceDiscoveryEventType::ServiceCreated,
                    descriptor.clone(),
                )];
                out.extend(self.connected_peers().into_iter().map(|peer| {
                    DiscoveryOut::SendToPeer(
                        peer,
                        ServiceDiscoveryEventType::ServiceCreated,
                        descriptor.clone(),
                    )
                }));
                out
            }
            DiscoveryIn::LocalServiceRemoved(descriptor) => {
                if let Some(list) = self.by_participant.get_mut(&self.own_name) {
                    list.retain(|d| d != &descriptor);
                }
                let mut out = vec![DiscoveryOut::Event(
                    ServiceDiscoveryEventType::ServiceRemoved,
                    descriptor.clone(),
                )];
                out.extend(self.connected_peers().into_iter().map(|peer| {
                    DiscoveryOut::SendToPeer(
                        peer,
                        ServiceDiscoveryEventType::ServiceRemoved,
                        descriptor.clone(),
                    )
                }));
                out
            }
            DiscoveryIn::PeerConnected(peer, peer_name) => {
                self.peer_names.insert(peer, peer_name);
                self.own_descriptors()
                    .into_iter()
                    .map(|d| {
                        DiscoveryOut::SendToPeer(peer, ServiceDiscoveryEventType::ServiceCreated, d)
                    })
                    .collect()
            }
            DiscoveryIn::PeerDisconnected(peer) => {
                let Some(name) = self.peer_names.remove(&peer) else {
                    return vec![];
                };
                let removed = self.by_participant.remove(&name).unwrap_or_default();
                removed
                    .into_iter()
                    .map(|d| DiscoveryOut::Event(ServiceDiscoveryEventType::ServiceRemoved, d))
                    .collect()
            }
            DiscoveryIn::PeerEvent(event_type, descriptor) => {
                let list = self
                    .by_participant
                    .entry(descriptor.participant_name.clone())
                    .or_default();
                match event_type {
                    ServiceDiscoveryEventType::ServiceCreated => {
                        if !list.contains(&descriptor) {
                            list.push(descriptor.clone());
                        }
                    }
                    ServiceDiscoveryEventType::ServiceRemoved => {
                        list.retain(|d| d != &descriptor);
                    }
                }
                vec![DiscoveryOut::Event(event_type, descriptor)]
            }
            DiscoveryIn::Snapshot => {
                let all: Vec<ServiceDescriptor> =
                    self.by_participant.values().flatten().cloned().collect();
                vec![DiscoveryOut::Snapshot(all)]
            }
        }
    }
}

#[platform_async_trait()]
impl SubsystemHandler<DiscoveryIn, DiscoveryOut> for Discovery {
    async fn messages(&mut self, from_broker: Vec<DiscoveryIn>) -> Vec<DiscoveryOut> {
        from_broker
            .into_iter()
            .flat_map(|msg| self.handle(msg))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NetworkType, ServiceType};
    use fabric_arch::ids::EndpointIdGenerator;

    fn descriptor(participant: &str, service: &str) -> ServiceDescriptor {
        let gen = EndpointIdGenerator::new();
        ServiceDescriptor {
            participant_name: participant.to_string(),
            service_name: service.to_string(),
            service_type: ServiceType::Controller,
            network_name: "PT_CAN".to_string(),
            network_type: NetworkType::Can,
            service_id: gen.next_id(),
            supplemental: HashMap::new(),
        }
    }

    #[test]
    fn local_creation_notifies_peers() {
        let mut d = Discovery::new("ECU1");
        let p1 = ParticipantId::from_name("ECU2");
        d.handle(DiscoveryIn::PeerConnected(p1, "ECU2".into()));
        let out = d.handle(DiscoveryIn::LocalServiceCreated(descriptor("ECU1", "CAN1")));
        assert!(out
            .iter()
            .any(|o| matches!(o, DiscoveryOut::SendToPeer(peer, _, _) if *peer == p1)));
    }

    #[test]
    fn peer_connect_replays_our_descriptors() {
        let mut d = Discovery::new("ECU1");
        d.handle(DiscoveryIn::LocalServiceCreated(descriptor("ECU1", "CAN1")));
        let p1 = ParticipantId::from_name("ECU2");
        let out = d.handle(DiscoveryIn::PeerConnected(p1, "ECU2".into()));
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            DiscoveryOut::SendToPeer(_, ServiceDiscoveryEventType::ServiceCreated, _)
        ));
    }

    #[test]
    fn peer_disconnect_synthesizes_removals() {
        let mut d = Discovery::new("ECU1");
        let p1 = ParticipantId::from_name("ECU2");
        d.handle(DiscoveryIn::PeerConnected(p1, "ECU2".into()));
        d.handle(DiscoveryIn::PeerEvent(
            ServiceDiscoveryEventType::ServiceCreated,
            descriptor("ECU2", "CAN1"),
        ));
        let out = d.handle(DiscoveryIn::PeerDisconnected(p1));
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            DiscoveryOut::Event(ServiceDiscoveryEventType::ServiceRemoved, _)
        ));
    }

    #[test]
    fn snapshot_includes_local_and_peer_descriptors() {
        let mut d = Discovery::new("ECU1");
        d.handle(DiscoveryIn::LocalServiceCreated(descriptor("ECU1", "CAN1")));
        d.handle(DiscoveryIn::PeerEvent(
            ServiceDiscoveryEventType::ServiceCreated,
            descriptor("ECU2", "CAN1"),
        ));
        let out = d.handle(DiscoveryIn::Snapshot);
        match &out[0] {
            DiscoveryOut::Snapshot(all) => assert_eq!(all.len(), 2),
            _ => panic!("expected snapshot"),
        }
    }
}
