//! A participant's half of the mesh bootstrap protocol: dial the
//! registry, learn who else is in the domain, connect directly to each of
//! them, and keep listening for newcomers the registry forwards later.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use fabric_arch::broker::Broker;
use fabric_arch::ids::ParticipantId;
use fabric_arch::transport::{PeerConn, PeerListener, TransportError, TransportIn, TransportOut};

use crate::model::ListenEndpoint;
use crate::protocol::{announcement, WireMessage};

/// Announces a peer connection that just became usable, so a higher layer
/// (router, discovery) can hook its tap without polling `MeshClient`.
pub struct NewPeer {
    pub id: ParticipantId,
    pub name: String,
    pub conn: Broker<TransportIn, TransportOut>,
}

type NewPeerTx = UnboundedSender<NewPeer>;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("participant name '{0}' is already in use at this registry")]
    NameInUse(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
    #[error("registry closed the connection before replying")]
    RegistryClosed,
    #[error("peer has no listen endpoint to dial")]
    NoEndpoint,
    #[error("peer connection closed before the handshake completed")]
    HandshakeIncomplete,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type PeerMap = Arc<Mutex<HashMap<ParticipantId, Broker<TransportIn, TransportOut>>>>;
type PeerNames = Arc<Mutex<HashMap<ParticipantId, String>>>;

/// A participant fully bootstrapped into the mesh: a live connection to the
/// registry and a direct connection to every other participant known so
/// far (more are added in the background as the registry forwards them).
#[derive(Clone)]
pub struct MeshClient {
    pub own_name: String,
    pub own_id: ParticipantId,
    registry_conn: Broker<TransportIn, TransportOut>,
    peers: PeerMap,
    peer_names: PeerNames,
}

impl MeshClient {
    /// Dials `registry_uri`, announces `own_name`/`own_id`, connects to
    /// every participant already registered, and spawns a background task
    /// that connects to any participant the registry announces afterwards.
    /// Also binds `listen_port` to accept inbound connections from peers
    /// that discover us the same way.
    pub async fn join(
        own_name: &str,
        own_id: ParticipantId,
        own_endpoints: Vec<ListenEndpoint>,
        registry_addr: &str,
        listen_port: u16,
    ) -> Result<(Self, UnboundedReceiver<NewPeer>), MeshError> {
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let peer_names: PeerNames = Arc::new(Mutex::new(HashMap::new()));
        let (new_peer_tx, new_peer_rx) = unbounded_channel();

        let mut incoming = PeerListener::bind(listen_port).await?;
        {
            let peers = peers.clone();
            let peer_names = peer_names.clone();
            let own_name = own_name.to_string();
            let new_peer_tx = new_peer_tx.clone();
            tokio::spawn(async move {
                while let Some((_id, stream)) = incoming.recv().await {
                    let own_name = own_name.clone();
                    let peers = peers.clone();
                    let peer_names = peer_names.clone();
                    let new_peer_tx = new_peer_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            accept_peer(stream, &own_name, peers, peer_names, new_peer_tx).await
                        {
                            log::warn!("inbound peer handshake failed: {e:#}");
                        }
                    });
                }
            });
        }

        let mut registry_conn = PeerConn::connect(registry_addr).await?;
        registry_conn.emit_msg_in(TransportIn::Send(Bytes::from(
            announcement(own_name, own_id, own_endpoints).encode(),
        )))?;
        registry_conn.emit_msg_in(TransportIn::Flush)?;

        let (mut tap, _) = registry_conn.get_tap_out().await?;
        let known = loop {
            match tap.recv().await {
                Some(TransportOut::Received(bytes)) => match WireMessage::decode(&bytes)? {
                    WireMessage::KnownParticipants { participants } => break participants,
                    WireMessage::NameInUse => {
                        return Err(MeshError::NameInUse(own_name.to_string()))
                    }
                    _ => continue,
                },
                Some(TransportOut::PeerShutdown) | None => return Err(MeshError::RegistryClosed),
                _ => continue,
            }
        };

        for record in known {
            if record.name == own_name {
                continue;
            }
            match dial_peer(&record.endpoints, own_name, own_id).await {
                Ok(conn) => {
                    peers.lock().await.insert(record.id, conn.clone());
                    peer_names.lock().await.insert(record.id, record.name.clone());
                    let _ = new_peer_tx.send(NewPeer {
                        id: record.id,
                        name: record.name.clone(),
                        conn,
                    });
                }
                Err(e) => log::warn!("couldn't connect to peer '{}': {e:#}", record.name),
            }
        }

        {
            let peers = peers.clone();
            let peer_names = peer_names.clone();
            let own_name = own_name.to_string();
            let mut registry_tap = tap;
            let new_peer_tx = new_peer_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = registry_tap.recv().await {
                    match event {
                        TransportOut::Received(bytes) => {
                            if let Ok(WireMessage::ParticipantAnnouncement {
                                name, id, endpoints, ..
                            }) = WireMessage::decode(&bytes)
                            {
                                if name == own_name {
                                    continue;
                                }
                                match dial_peer(&endpoints, &own_name, own_id).await {
                                    Ok(conn) => {
                                        peers.lock().await.insert(id, conn.clone());
                                        peer_names.lock().await.insert(id, name.clone());
                                        let _ = new_peer_tx.send(NewPeer { id, name, conn });
                                    }
                                    Err(e) => {
                                        log::warn!("couldn't connect to newcomer '{name}': {e:#}")
                                    }
                                }
                            }
                        }
                        TransportOut::PeerShutdown => {
                            log::warn!("lost connection to registry");
                            return;
                        }
                        _ => {}
                    }
                }
            });
        }

        Ok((
            MeshClient {
                own_name: own_name.to_string(),
                own_id,
                registry_conn,
                peers,
                peer_names,
            },
            new_peer_rx,
        ))
    }

    pub async fn peer_ids(&self) -> Vec<ParticipantId> {
        self.peers.lock().await.keys().copied().collect()
    }

    pub async fn peer_conn(&self, id: ParticipantId) -> Option<Broker<TransportIn, TransportOut>> {
        self.peers.lock().await.get(&id).cloned()
    }

    pub async fn peer_name(&self, id: ParticipantId) -> Option<String> {
        self.peer_names.lock().await.get(&id).cloned()
    }

    pub async fn peer_id_by_name(&self, name: &str) -> Option<ParticipantId> {
        self.peer_names
            .lock()
            .await
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Sends `ShutdownNotification` to the registry and drops the
    /// connection; peers notice via their own `PeerShutdown` event.
    pub async fn leave(&mut self) -> Result<(), MeshError> {
        self.registry_conn
            .emit_msg_in(TransportIn::Send(Bytes::from(
                WireMessage::ShutdownNotification.encode(),
            )))?;
        self.registry_conn.emit_msg_in(TransportIn::Flush)?;
        Ok(())
    }
}

async fn dial_peer(
    endpoints: &[ListenEndpoint],
    own_name: &str,
    own_id: ParticipantId,
) -> Result<Broker<TransportIn, TransportOut>, MeshError> {
    let endpoint = endpoints.first().ok_or(MeshError::NoEndpoint)?;
    let mut conn = PeerConn::connect(&endpoint.to_string()).await?;
    conn.emit_msg_in(TransportIn::Send(Bytes::from(
        announcement(own_name, own_id, vec![]).encode(),
    )))?;
    conn.emit_msg_in(TransportIn::Flush)?;

    let (mut tap, _) = conn.get_tap_out().await?;
    loop {
        match tap.recv().await {
            Some(TransportOut::Received(bytes)) => {
                if let Ok(WireMessage::ReplyToParticipantAnnouncement { .. }) =
                    WireMessage::decode(&bytes)
                {
                    return Ok(conn);
                }
            }
            Some(TransportOut::PeerShutdown) | None => return Err(MeshError::HandshakeIncomplete),
            _ => continue,
        }
    }
}

async fn accept_peer(
    stream: tokio::net::TcpStream,
    own_name: &str,
    peers: PeerMap,
    peer_names: PeerNames,
    new_peer_tx: NewPeerTx,
) -> Result<(), MeshError> {
    let mut conn = PeerConn::from_stream(stream).await?;
    let (mut tap, _) = conn.get_tap_out().await?;
    let (name, id) = loop {
        match tap.recv().await {
            Some(TransportOut::Received(bytes)) => {
                if let WireMessage::ParticipantAnnouncement { name, id, .. } =
                    WireMessage::decode(&bytes)?
                {
                    break (name, id);
                }
            }
            Some(TransportOut::PeerShutdown) | None => return Err(MeshError::HandshakeIncomplete),
            _ => continue,
        }
    };
    log::debug!("accepted inbound peer '{name}'");
    conn.emit_msg_in(TransportIn::Send(Bytes::from(
        WireMessage::ReplyToParticipantAnnouncement {
            name: own_name.to_string(),
            id: ParticipantId::from_name(own_name),
        }
        .encode(),
    )))?;
    conn.emit_msg_in(TransportIn::Flush)?;
    peers.lock().await.insert(id, conn.clone());
    peer_names.lock().await.insert(id, name.clone());
    let _ = new_peer_tx.send(NewPeer { id, name, conn });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::registry::server::RegistryServer;
    use crate::testing::next_test_port;

    #[tokio::test]
    async fn three_participants_form_a_full_mesh() -> anyhow::Result<()> {
        let registry = RegistryServer::new();
        let port = next_test_port();
        let registry_cl = registry.clone();
        tokio::spawn(async move {
            let _ = registry_cl.run(port).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let registry_addr = format!("127.0.0.1:{port}");

        let ecu1_port = next_test_port();
        let (ecu1, mut ecu1_new_peers) = MeshClient::join(
            "ECU1",
            ParticipantId::from_name("ECU1"),
            vec![ListenEndpoint {
                host: "127.0.0.1".into(),
                port: ecu1_port,
            }],
            &registry_addr,
            ecu1_port,
        )
        .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ecu2_port = next_test_port();
        let (ecu2, _ecu2_new_peers) = MeshClient::join(
            "ECU2",
            ParticipantId::from_name("ECU2"),
            vec![ListenEndpoint {
                host: "127.0.0.1".into(),
                port: ecu2_port,
            }],
            &registry_addr,
            ecu2_port,
        )
        .await?;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ecu1.peer_count().await, 1);
        assert_eq!(ecu2.peer_count().await, 1);

        let announced = ecu1_new_peers.try_recv().expect("ecu2 announced as a new peer");
        assert_eq!(announced.name, "ECU2");
        Ok(())
    }
}
