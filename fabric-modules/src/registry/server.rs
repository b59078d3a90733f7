//! The registry process: accepts participant connections, hands out the
//! current membership list, and forwards new announcements to everyone
//! already connected so the mesh stays fully connected.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use fabric_arch::broker::Broker;
use fabric_arch::ids::ParticipantId;
use fabric_arch::transport::{PeerConn, PeerListener, TransportIn, TransportOut};

use crate::protocol::{ParticipantRecord, WireMessage};

struct Entry {
    record: ParticipantRecord,
    conn: Broker<TransportIn, TransportOut>,
}

#[derive(Default)]
struct State {
    by_name: HashMap<String, Entry>,
}

/// Shared, cloneable handle to a running registry; mostly useful for tests
/// that want to inspect membership without going through the wire.
#[derive(Clone)]
pub struct RegistryServer {
    state: Arc<Mutex<State>>,
}

impl RegistryServer {
    pub fn new() -> Self {
        RegistryServer {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub async fn participant_count(&self) -> usize {
        self.state.lock().await.by_name.len()
    }

    /// Binds `port` and services connections until the process exits or the
    /// accept loop errors out.
    pub async fn run(&self, port: u16) -> anyhow::Result<()> {
        let mut incoming = PeerListener::bind(port).await?;
        while let Some((_id, stream)) = incoming.recv().await {
            let conn = PeerConn::from_stream(stream).await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.serve_one(conn).await {
                    log::warn!("registry connection ended: {e:#}");
                }
            });
        }
        Ok(())
    }

    async fn serve_one(&self, mut conn: Broker<TransportIn, TransportOut>) -> anyhow::Result<()> {
        let (mut tap, _) = conn.get_tap_out().await?;

        let (name, id, endpoints) = loop {
            match tap.recv().await {
                Some(TransportOut::Received(bytes)) => match WireMessage::decode(&bytes) {
                    Ok(WireMessage::ParticipantAnnouncement {
                        name, id, endpoints, ..
                    }) => break (name, id, endpoints),
                    Ok(_) => {
                        log::warn!("registry: expected ParticipantAnnouncement first, ignoring");
                        continue;
                    }
                    Err(e) => {
                        log::warn!("registry: malformed announcement: {e}");
                        return Ok(());
                    }
                },
                Some(TransportOut::PeerShutdown) | None => return Ok(()),
                _ => continue,
            }
        };

        let existing = {
            let mut state = self.state.lock().await;
            if state.by_name.contains_key(&name) {
                let _ = conn.emit_msg_in(TransportIn::Send(Bytes::from(
                    WireMessage::NameInUse.encode(),
                )));
                conn.emit_msg_in(TransportIn::Flush)?;
                return Ok(());
            }
            let existing: Vec<ParticipantRecord> = state
                .by_name
                .values()
                .map(|e| e.record.clone())
                .collect();
            state.by_name.insert(
                name.clone(),
                Entry {
                    record: ParticipantRecord {
                        name: name.clone(),
                        id,
                        endpoints: endpoints.clone(),
                    },
                    conn: conn.clone(),
                },
            );
            existing
        };

        conn.emit_msg_in(TransportIn::Send(Bytes::from(
            WireMessage::KnownParticipants {
                participants: existing.clone(),
            }
            .encode(),
        )))?;
        conn.emit_msg_in(TransportIn::Flush)?;

        self.forward_to_all_but(
            &name,
            WireMessage::ParticipantAnnouncement {
                protocol_version: crate::codec::PROTOCOL_VERSION,
                name: name.clone(),
                id,
                endpoints,
            },
        )
        .await;

        loop {
            match tap.recv().await {
                Some(TransportOut::Received(bytes)) => {
                    if let Ok(WireMessage::ShutdownNotification) = WireMessage::decode(&bytes) {
                        break;
                    }
                }
                Some(TransportOut::PeerShutdown) | None => break,
                _ => continue,
            }
        }

        self.state.lock().await.by_name.remove(&name);
        Ok(())
    }

    async fn forward_to_all_but(&self, except: &str, msg: WireMessage) {
        let body = Bytes::from(msg.encode());
        let state = self.state.lock().await;
        for (name, entry) in state.by_name.iter() {
            if name == except {
                continue;
            }
            let mut conn = entry.conn.clone();
            if conn.emit_msg_in(TransportIn::Send(body.clone())).is_ok() {
                let _ = conn.emit_msg_in(TransportIn::Flush);
            }
        }
    }
}

impl Default for RegistryServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::model::ListenEndpoint;
    use crate::protocol::announcement;
    use crate::testing::next_test_port;

    async fn client_announce(port: u16, name: &str) -> Broker<TransportIn, TransportOut> {
        let mut conn = PeerConn::connect(&format!("127.0.0.1:{port}"))
            .await
            .unwrap();
        let msg = announcement(
            name,
            ParticipantId::from_name(name),
            vec![ListenEndpoint {
                host: "127.0.0.1".into(),
                port: 0,
            }],
        );
        conn.emit_msg_in(TransportIn::Send(Bytes::from(msg.encode())))
            .unwrap();
        conn.emit_msg_in(TransportIn::Flush).unwrap();
        conn
    }

    #[tokio::test]
    async fn second_join_receives_first_in_known_participants() -> anyhow::Result<()> {
        let registry = RegistryServer::new();
        let port = next_test_port();
        let registry_cl = registry.clone();
        tokio::spawn(async move {
            let _ = registry_cl.run(port).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut c1 = client_announce(port, "ECU1").await;
        let (mut tap1, _) = c1.get_tap_out().await?;
        let _known1 = tokio::time::timeout(Duration::from_secs(1), tap1.recv()).await?;

        let mut c2 = client_announce(port, "ECU2").await;
        let (mut tap2, _) = c2.get_tap_out().await?;
        let known2 = tokio::time::timeout(Duration::from_secs(1), tap2.recv()).await?;
        match known2 {
            Some(TransportOut::Received(bytes)) => match WireMessage::decode(&bytes)? {
                WireMessage::KnownParticipants { participants } => {
                    assert_eq!(participants.len(), 1);
                    assert_eq!(participants[0].name, "ECU1");
                }
                other => panic!("unexpected message: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }

        let forwarded = tokio::time::timeout(Duration::from_secs(1), tap1.recv()).await?;
        match forwarded {
            Some(TransportOut::Received(bytes)) => match WireMessage::decode(&bytes)? {
                WireMessage::ParticipantAnnouncement { name, .. } => assert_eq!(name, "ECU2"),
                other => panic!("unexpected message: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() -> anyhow::Result<()> {
        let registry = RegistryServer::new();
        let port = next_test_port();
        let registry_cl = registry.clone();
        tokio::spawn(async move {
            let _ = registry_cl.run(port).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut c1 = client_announce(port, "ECU1").await;
        let (mut tap1, _) = c1.get_tap_out().await?;
        let _known1 = tokio::time::timeout(Duration::from_secs(1), tap1.recv()).await?;

        let mut c2 = client_announce(port, "ECU1").await;
        let (mut tap2, _) = c2.get_tap_out().await?;
        let reply = tokio::time::timeout(Duration::from_secs(1), tap2.recv()).await?;
        match reply {
            Some(TransportOut::Received(bytes)) => {
                assert_eq!(WireMessage::decode(&bytes)?, WireMessage::NameInUse);
            }
            other => panic!("unexpected: {other:?}"),
        }
        Ok(())
    }
}
