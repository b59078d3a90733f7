//! Message router (component D): delivers typed messages within a
//! participant to the right local receiver, and out to the right subset of
//! connected peers, mirroring each peer's subscription plane locally.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use fabric_arch::broker::{Broker, Subsystem, SubsystemHandler};
use fabric_arch::ids::EndpointId;
use fabric_arch::ids::ParticipantId;
use fabric_arch::platform_async_trait;

pub type Topic = (String, EndpointId);

/// The wire envelope for a message travelling between two peers on a given
/// (networkName, endpointId) topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerMessage {
    pub network_name: String,
    pub endpoint_id: EndpointId,
    pub source: ParticipantId,
    pub kind: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouterIn {
    /// A local controller registers itself at (networkName, endpointId).
    /// Duplicate registration for the same topic is a programming error and
    /// is logged, not enforced here - callers are expected to not do it.
    RegisterLocal(String, EndpointId),
    /// Local controller unregisters, e.g. on destruction.
    UnregisterLocal(String, EndpointId),
    /// Local send. `target` restricts delivery to one peer (a targeted
    /// send); `None` means broadcast to every subscribed peer.
    /// `history_len` is 0 or 1; see module docs.
    Send {
        network_name: String,
        endpoint_id: EndpointId,
        kind: String,
        body: Vec<u8>,
        target: Option<ParticipantId>,
        history_len: u8,
    },
    /// A `SubscriptionAnnouncement` arrived from a peer.
    PeerSubscribed(ParticipantId, String, EndpointId),
    /// A `PeerMessage` envelope arrived from a peer.
    PeerEnvelope(ParticipantId, PeerMessage),
    /// The peer-connection layer reports a new, fully-announced peer.
    PeerConnected(ParticipantId),
    PeerDisconnected(ParticipantId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouterOut {
    /// Hand a message to the locally registered receiver for this topic.
    Deliver {
        network_name: String,
        endpoint_id: EndpointId,
        source: ParticipantId,
        kind: String,
        body: Vec<u8>,
    },
    /// Send a `SubscriptionAnnouncement` to one peer.
    SendSubscription(ParticipantId, String, EndpointId),
    /// Ship an envelope out to one peer, via the transport layer.
    SendEnvelope(ParticipantId, PeerMessage),
}

/// Tracks local topic ownership and the mirrored view of every peer's
/// subscriptions, and resolves sends against that view.
pub struct Router {
    own_id: ParticipantId,
    local_topics: Vec<Topic>,
    peers: Vec<ParticipantId>,
    peer_subscriptions: HashMap<ParticipantId, Vec<Topic>>,
    history: HashMap<Topic, PeerMessage>,
}

impl Router {
    pub fn new(own_id: ParticipantId) -> Self {
        Router {
            own_id,
            local_topics: Vec::new(),
            peers: Vec::new(),
            peer_subscriptions: HashMap::new(),
            history: HashMap::new(),
        }
    }

    pub async fn start(own_id: ParticipantId) -> anyhow::Result<Broker<RouterIn, RouterOut>> {
        let mut broker = Broker::new();
        broker
            .add_subsystem(Subsystem::Handler(Box::new(Router::new(own_id))))
            .await?;
        Ok(broker)
    }

    fn subscribers(&self, topic: &Topic) -> Vec<ParticipantId> {
        self.peer_subscriptions
            .iter()
            .filter(|(_, topics)| topics.contains(topic))
            .map(|(peer, _)| *peer)
            .collect()
    }

    fn handle(&mut self, msg: RouterIn) -> Vec<RouterOut> {
        match msg {
            RouterIn::RegisterLocal(network_name, endpoint_id) => {
                let topic = (network_name.clone(), endpoint_id);
                if !self.local_topics.contains(&topic) {
                    self.local_topics.push(topic);
                }
                self.peers
                    .iter()
                    .map(|peer| RouterOut::SendSubscription(*peer, network_name.clone(), endpoint_id))
                    .collect()
            }
            RouterIn::UnregisterLocal(network_name, endpoint_id) => {
                self.local_topics.retain(|t| t != &(network_name, endpoint_id));
                vec![]
            }
            RouterIn::Send {
                network_name,
                endpoint_id,
                kind,
                body,
                target,
                history_len,
            } => {
                let topic = (network_name.clone(), endpoint_id);
                let envelope = PeerMessage {
                    network_name: network_name.clone(),
                    endpoint_id,
                    source: self.own_id,
                    kind,
                    body,
                };
                if history_len >= 1 {
                    self.history.insert(topic.clone(), envelope.clone());
                }
                let mut out = Vec::new();
                if target.is_none() && self.local_topics.contains(&topic) {
                    out.push(RouterOut::Deliver {
                        network_name: envelope.network_name.clone(),
                        endpoint_id: envelope.endpoint_id,
                        source: envelope.source,
                        kind: envelope.kind.clone(),
                        body: envelope.body.clone(),
                    });
                }
                let recipients: Vec<ParticipantId> = match target {
                    Some(peer) => vec![peer],
                    None => self.subscribers(&topic),
                };
                out.extend(
                    recipients
                        .into_iter()
                        .map(|peer| RouterOut::SendEnvelope(peer, envelope.clone())),
                );
                out
            }
            RouterIn::PeerSubscribed(peer, network_name, endpoint_id) => {
                let topic = (network_name, endpoint_id);
                let topics = self.peer_subscriptions.entry(peer).or_default();
                if !topics.contains(&topic) {
                    topics.push(topic.clone());
                }
                match self.history.get(&topic) {
                    Some(cached) => vec![RouterOut::SendEnvelope(peer, cached.clone())],
                    None => vec![],
                }
            }
            RouterIn::PeerEnvelope(peer, msg) => {
                let _ = peer;
                vec![RouterOut::Deliver {
                    network_name: msg.network_name,
                    endpoint_id: msg.endpoint_id,
                    source: msg.source,
                    kind: msg.kind,
                    body: msg.body,
                }]
            }
            RouterIn::PeerConnected(peer) => {
                if !self.peers.contains(&peer) {
                    self.peers.push(peer);
                }
                self.local_topics
                    .clone()
                    .into_iter()
                    .map(|(network_name, endpoint_id)| {
                        RouterOut::SendSubscription(peer, network_name, endpoint_id)
                    })
                    .collect()
            }
            RouterIn::PeerDisconnected(peer) => {
                self.peers.retain(|p| p != &peer);
                self.peer_subscriptions.remove(&peer);
                vec![]
            }
        }
    }
}

#[platform_async_trait()]
impl SubsystemHandler<RouterIn, RouterOut> for Router {
    async fn messages(&mut self, from_broker: Vec<RouterIn>) -> Vec<RouterOut> {
        from_broker
            .into_iter()
            .flat_map(|msg| self.handle(msg))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(n: u64) -> EndpointId {
        // tests only need distinct ids, not a generator
        let gen = fabric_arch::ids::EndpointIdGenerator::new();
        for _ in 1..n {
            gen.next_id();
        }
        gen.next_id()
    }

    #[test]
    fn broadcast_goes_to_all_subscribers() {
        let mut r = Router::new(ParticipantId::from_name("me"));
        let p1 = ParticipantId::from_name("p1");
        let p2 = ParticipantId::from_name("p2");
        let topic_ep = endpoint(1);
        r.handle(RouterIn::PeerConnected(p1));
        r.handle(RouterIn::PeerConnected(p2));
        r.handle(RouterIn::PeerSubscribed(p1, "net".into(), topic_ep));
        r.handle(RouterIn::PeerSubscribed(p2, "net".into(), topic_ep));

        let out = r.handle(RouterIn::Send {
            network_name: "net".into(),
            endpoint_id: topic_ep,
            kind: "Frame".into(),
            body: vec![1, 2, 3],
            target: None,
            history_len: 0,
        });
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn targeted_send_goes_to_one_peer_only() {
        let mut r = Router::new(ParticipantId::from_name("me"));
        let p1 = ParticipantId::from_name("p1");
        let p2 = ParticipantId::from_name("p2");
        let topic_ep = endpoint(1);
        r.handle(RouterIn::PeerConnected(p1));
        r.handle(RouterIn::PeerConnected(p2));
        r.handle(RouterIn::PeerSubscribed(p1, "net".into(), topic_ep));
        r.handle(RouterIn::PeerSubscribed(p2, "net".into(), topic_ep));

        let out = r.handle(RouterIn::Send {
            network_name: "net".into(),
            endpoint_id: topic_ep,
            kind: "Frame".into(),
            body: vec![],
            target: Some(p1),
            history_len: 0,
        });
        assert_eq!(out, vec![RouterOut::SendEnvelope(
            p1,
            PeerMessage {
                network_name: "net".into(),
                endpoint_id: topic_ep,
                source: ParticipantId::from_name("me"),
                kind: "Frame".into(),
                body: vec![],
            }
        )]);
    }

    #[test]
    fn history_replays_to_late_subscriber() {
        let mut r = Router::new(ParticipantId::from_name("me"));
        let p1 = ParticipantId::from_name("p1");
        let topic_ep = endpoint(1);
        r.handle(RouterIn::PeerConnected(p1));
        r.handle(RouterIn::Send {
            network_name: "net".into(),
            endpoint_id: topic_ep,
            kind: "Frame".into(),
            body: vec![9],
            target: None,
            history_len: 1,
        });

        let out = r.handle(RouterIn::PeerSubscribed(p1, "net".into(), topic_ep));
        assert_eq!(out.len(), 1);
        match &out[0] {
            RouterOut::SendEnvelope(peer, msg) => {
                assert_eq!(*peer, p1);
                assert_eq!(msg.body, vec![9]);
            }
            _ => panic!("expected SendEnvelope"),
        }
    }

    #[test]
    fn new_local_registration_announces_to_known_peers() {
        let mut r = Router::new(ParticipantId::from_name("me"));
        let p1 = ParticipantId::from_name("p1");
        let topic_ep = endpoint(1);
        r.handle(RouterIn::PeerConnected(p1));
        let out = r.handle(RouterIn::RegisterLocal("net".into(), topic_ep));
        assert_eq!(out, vec![RouterOut::SendSubscription(p1, "net".into(), topic_ep)]);
    }

    #[test]
    fn broadcast_to_self_subscribed_topic_delivers_locally() {
        let mut r = Router::new(ParticipantId::from_name("me"));
        let p1 = ParticipantId::from_name("p1");
        let topic_ep = endpoint(1);
        r.handle(RouterIn::PeerConnected(p1));
        r.handle(RouterIn::RegisterLocal("net".into(), topic_ep));
        r.handle(RouterIn::PeerSubscribed(p1, "net".into(), topic_ep));

        let out = r.handle(RouterIn::Send {
            network_name: "net".into(),
            endpoint_id: topic_ep,
            kind: "Frame".into(),
            body: vec![7],
            target: None,
            history_len: 0,
        });
        assert!(out.contains(&RouterOut::Deliver {
            network_name: "net".into(),
            endpoint_id: topic_ep,
            source: ParticipantId::from_name("me"),
            kind: "Frame".into(),
            body: vec![7],
        }));
        assert!(out.contains(&RouterOut::SendEnvelope(
            p1,
            PeerMessage {
                network_name: "net".into(),
                endpoint_id: topic_ep,
                source: ParticipantId::from_name("me"),
                kind: "Frame".into(),
                body: vec![7],
            }
        )));
    }

    #[test]
    fn targeted_send_does_not_self_deliver() {
        let mut r = Router::new(ParticipantId::from_name("me"));
        let p1 = ParticipantId::from_name("p1");
        let topic_ep = endpoint(1);
        r.handle(RouterIn::PeerConnected(p1));
        r.handle(RouterIn::RegisterLocal("net".into(), topic_ep));

        let out = r.handle(RouterIn::Send {
            network_name: "net".into(),
            endpoint_id: topic_ep,
            kind: "Frame".into(),
            body: vec![],
            target: Some(p1),
            history_len: 0,
        });
        assert!(!out.iter().any(|o| matches!(o, RouterOut::Deliver { .. })));
    }

    #[test]
    fn disconnect_removes_subscriptions() {
        let mut r = Router::new(ParticipantId::from_name("me"));
        let p1 = ParticipantId::from_name("p1");
        let topic_ep = endpoint(1);
        r.handle(RouterIn::PeerConnected(p1));
        r.handle(RouterIn::PeerSubscribed(p1, "net".into(), topic_ep));
        r.handle(RouterIn::PeerDisconnected(p1));
        let out = r.handle(RouterIn::Send {
            network_name: "net".into(),
            endpoint_id: topic_ep,
            kind: "Frame".into(),
            body: vec![],
            target: None,
            history_len: 0,
        });
        assert!(out.is_empty());
    }
}
