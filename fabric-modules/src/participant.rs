//! Participant glue: wires the mesh transport to every component broker -
//! router, discovery, lifecycle, monitor, time-sync - and routes the system
//! controller's intents onto the wire, so a demo program has one type to
//! construct instead of wiring components A-I together itself.

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use fabric_arch::broker::Broker;
use fabric_arch::ids::ParticipantId;
use fabric_arch::tasks::{now, spawn_local};
use fabric_arch::transport::{TransportIn, TransportOut};

use crate::controller::{ControllerOut, SystemController};
use crate::discovery::{Discovery, DiscoveryIn, DiscoveryOut};
use crate::lifecycle::{Lifecycle, LifecycleConfig, LifecycleIn, LifecycleOut};
use crate::model::ParticipantStatus;
use crate::monitor::{Monitor, MonitorIn, MonitorOut};
use crate::participant_config::ParticipantConfig;
use crate::protocol::WireMessage;
use crate::registry::client::{MeshClient, NewPeer};
use crate::router::{PeerMessage, Router, RouterIn, RouterOut};
use crate::timesync::{TimeSync, TimeSyncConfig, TimeSyncIn, TimeSyncOut};

/// A fully bootstrapped participant: a live connection to every peer in the
/// mesh, plus the router/discovery/lifecycle/monitor/timesync brokers wired
/// to it and to each other. Dropping a `Participant` drops every broker it
/// holds; the background forwarding tasks exit once their tap closes.
pub struct Participant {
    pub own_name: String,
    pub own_id: ParticipantId,
    pub mesh: MeshClient,
    pub router: Broker<RouterIn, RouterOut>,
    pub discovery: Broker<DiscoveryIn, DiscoveryOut>,
    pub lifecycle: Broker<LifecycleIn, LifecycleOut>,
    pub monitor: Broker<MonitorIn, MonitorOut>,
    pub timesync: Broker<TimeSyncIn, TimeSyncOut>,
    controller: SystemController,
}

impl Participant {
    /// Joins the mesh described by `config`: dials the registry, connects to
    /// the rest of the domain, and starts every component broker. The
    /// returned `Participant` does not yet drive the lifecycle FSM forward -
    /// callers call [`Participant::start`] once their services are created.
    pub async fn join(config: &ParticipantConfig) -> anyhow::Result<Self> {
        let own_id = config.participant_id();
        let listen_port = config
            .listen_endpoints
            .first()
            .map(|e| e.port)
            .unwrap_or(0);

        let (mesh, new_peer_rx) = MeshClient::join(
            &config.participant_name,
            own_id,
            config.listen_endpoints.clone(),
            &config.registry_uri.as_endpoint().to_string(),
            listen_port,
        )
        .await?;

        let router = Router::start(own_id).await?;
        let discovery = Discovery::start(&config.participant_name).await?;
        let lifecycle = Lifecycle::start(LifecycleConfig::default()).await?;
        let monitor = Monitor::start().await?;
        let timesync = TimeSync::start(TimeSyncConfig::default()).await?;

        for id in mesh.peer_ids().await {
            if let (Some(conn), Some(name)) = (mesh.peer_conn(id).await, mesh.peer_name(id).await)
            {
                spawn_peer_link(
                    id,
                    name,
                    conn,
                    router.clone(),
                    discovery.clone(),
                    lifecycle.clone(),
                    monitor.clone(),
                    timesync.clone(),
                );
            }
        }
        spawn_new_peer_watcher(
            new_peer_rx,
            router.clone(),
            discovery.clone(),
            lifecycle.clone(),
            monitor.clone(),
            timesync.clone(),
        );
        spawn_router_forwarder(router.clone(), mesh.clone());
        spawn_discovery_forwarder(discovery.clone(), mesh.clone());
        spawn_lifecycle_forwarder(
            config.participant_name.clone(),
            lifecycle.clone(),
            monitor.clone(),
            mesh.clone(),
        );
        spawn_monitor_forwarder(monitor.clone(), lifecycle.clone());
        spawn_timesync_forwarder(timesync.clone(), mesh.clone());

        Ok(Participant {
            own_name: config.participant_name.clone(),
            own_id,
            mesh,
            router,
            discovery,
            lifecycle,
            monitor,
            timesync,
            controller: SystemController,
        })
    }

    /// The embedding participant has finished creating its services; enters
    /// the lifecycle FSM at `ServicesCreated`. Local-only - every
    /// participant calls its own, nothing is sent to peers.
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.lifecycle.emit_msg_in(LifecycleIn::Start)?;
        Ok(())
    }

    /// Sets the required-participants set for the system-state reducer and
    /// broadcasts it to every connected peer's monitor.
    pub async fn set_workflow_configuration(
        &mut self,
        required_participants: Vec<String>,
    ) -> anyhow::Result<()> {
        let out = self
            .controller
            .set_workflow_configuration(required_participants);
        self.dispatch(out).await
    }

    /// Broadcasts `Run` to every participant's lifecycle FSM, including this
    /// one's.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let out = self.controller.run();
        self.dispatch(out).await
    }

    /// Broadcasts `Stop` to every participant's lifecycle FSM, including this
    /// one's.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let out = self.controller.stop();
        self.dispatch(out).await
    }

    /// Broadcasts `AbortSimulation` to every participant's lifecycle FSM,
    /// including this one's.
    pub async fn abort_simulation(&mut self) -> anyhow::Result<()> {
        let out = self.controller.abort_simulation();
        self.dispatch(out).await
    }

    /// Unicasts `Shutdown` to the named participant's lifecycle FSM (which
    /// may be this one).
    pub async fn shutdown(&mut self, participant_name: &str) -> anyhow::Result<()> {
        let out = self.controller.shutdown(participant_name);
        self.dispatch(out).await
    }

    async fn dispatch(&mut self, out: ControllerOut) -> anyhow::Result<()> {
        match out {
            ControllerOut::Broadcast(cmd) => {
                self.lifecycle.emit_msg_in(LifecycleIn::Command(cmd))?;
                self.broadcast_wire(WireMessage::SystemCommandAnnouncement(cmd))
                    .await;
            }
            ControllerOut::Unicast(name, cmd) => {
                if name == self.own_name {
                    self.lifecycle
                        .emit_msg_in(LifecycleIn::ParticipantCommand(cmd))?;
                } else if let Some(id) = self.mesh.peer_id_by_name(&name).await {
                    send_to_peer(
                        &self.mesh,
                        id,
                        WireMessage::ParticipantCommandAnnouncement(cmd),
                    )
                    .await;
                } else {
                    log::warn!("unicast command to unknown participant '{name}'");
                }
            }
            ControllerOut::BroadcastWorkflowConfiguration(cfg) => {
                self.monitor
                    .emit_msg_in(MonitorIn::WorkflowConfiguration(cfg.clone()))?;
                self.broadcast_wire(WireMessage::WorkflowConfigurationUpdate(cfg))
                    .await;
            }
        }
        Ok(())
    }

    async fn broadcast_wire(&self, wire: WireMessage) {
        for id in self.mesh.peer_ids().await {
            send_to_peer(&self.mesh, id, wire.clone()).await;
        }
    }
}

/// Watches for peers that connect after `join` already returned (an inbound
/// dial, or the registry forwarding a newcomer) and links each the same way
/// as the peers known at join time.
fn spawn_new_peer_watcher(
    mut new_peer_rx: UnboundedReceiver<NewPeer>,
    router: Broker<RouterIn, RouterOut>,
    discovery: Broker<DiscoveryIn, DiscoveryOut>,
    lifecycle: Broker<LifecycleIn, LifecycleOut>,
    monitor: Broker<MonitorIn, MonitorOut>,
    timesync: Broker<TimeSyncIn, TimeSyncOut>,
) {
    spawn_local(async move {
        while let Some(peer) = new_peer_rx.recv().await {
            spawn_peer_link(
                peer.id,
                peer.name,
                peer.conn,
                router.clone(),
                discovery.clone(),
                lifecycle.clone(),
                monitor.clone(),
                timesync.clone(),
            );
        }
    });
}

/// Announces a peer to the router/discovery components and forwards every
/// frame it sends onward until it disconnects.
fn spawn_peer_link(
    id: ParticipantId,
    name: String,
    conn: Broker<TransportIn, TransportOut>,
    mut router: Broker<RouterIn, RouterOut>,
    mut discovery: Broker<DiscoveryIn, DiscoveryOut>,
    mut lifecycle: Broker<LifecycleIn, LifecycleOut>,
    mut monitor: Broker<MonitorIn, MonitorOut>,
    mut timesync: Broker<TimeSyncIn, TimeSyncOut>,
) {
    let _ = router.emit_msg_in(RouterIn::PeerConnected(id));
    let _ = discovery.emit_msg_in(DiscoveryIn::PeerConnected(id, name.clone()));

    spawn_local(async move {
        let mut conn = conn;
        let (mut tap, _) = match conn.get_tap_out().await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("couldn't tap peer '{name}': {e:#}");
                return;
            }
        };
        while let Some(event) = tap.recv().await {
            match event {
                TransportOut::Received(bytes) => match WireMessage::decode(&bytes) {
                    Ok(WireMessage::SubscriptionAnnouncement {
                        network_name,
                        endpoint_id,
                    }) => {
                        let _ = router.emit_msg_in(RouterIn::PeerSubscribed(
                            id,
                            network_name,
                            endpoint_id,
                        ));
                    }
                    Ok(WireMessage::PeerMessage {
                        network_name,
                        endpoint_id,
                        source,
                        kind,
                        body,
                    }) => {
                        let _ = router.emit_msg_in(RouterIn::PeerEnvelope(
                            id,
                            PeerMessage {
                                network_name,
                                endpoint_id,
                                source,
                                kind,
                                body,
                            },
                        ));
                    }
                    Ok(WireMessage::ServiceDiscoveryEvent {
                        event_type,
                        descriptor,
                    }) => {
                        let _ =
                            discovery.emit_msg_in(DiscoveryIn::PeerEvent(event_type, descriptor));
                    }
                    Ok(WireMessage::ParticipantStatusUpdate(status)) => {
                        let _ = monitor.emit_msg_in(MonitorIn::ParticipantStatus(status));
                    }
                    Ok(WireMessage::SystemCommandAnnouncement(cmd)) => {
                        let _ = lifecycle.emit_msg_in(LifecycleIn::Command(cmd));
                    }
                    Ok(WireMessage::ParticipantCommandAnnouncement(cmd)) => {
                        let _ = lifecycle.emit_msg_in(LifecycleIn::ParticipantCommand(cmd));
                    }
                    Ok(WireMessage::WorkflowConfigurationUpdate(cfg)) => {
                        let _ = monitor.emit_msg_in(MonitorIn::WorkflowConfiguration(cfg));
                    }
                    Ok(WireMessage::NextSimTaskAnnouncement(task)) => {
                        let _ = timesync.emit_msg_in(TimeSyncIn::PeerNextTask(id, task));
                    }
                    Ok(WireMessage::ShutdownNotification) => break,
                    Ok(_) => {}
                    Err(e) => log::warn!("malformed frame from peer '{name}': {e:#}"),
                },
                TransportOut::PeerShutdown => break,
                _ => {}
            }
        }
        let _ = router.emit_msg_in(RouterIn::PeerDisconnected(id));
        let _ = discovery.emit_msg_in(DiscoveryIn::PeerDisconnected(id));
        let _ = monitor.emit_msg_in(MonitorIn::ParticipantDisconnected(name));
        let _ = timesync.emit_msg_in(TimeSyncIn::PeerDisconnected(id));
    });
}

/// Ships every outbound router message to the right peer connection.
fn spawn_router_forwarder(mut router: Broker<RouterIn, RouterOut>, mesh: MeshClient) {
    spawn_local(async move {
        let (mut tap, _) = match router.get_tap_out().await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("couldn't tap router output: {e:#}");
                return;
            }
        };
        while let Some(event) = tap.recv().await {
            let (peer, wire) = match event {
                RouterOut::Deliver { .. } => continue,
                RouterOut::SendSubscription(peer, network_name, endpoint_id) => (
                    peer,
                    WireMessage::SubscriptionAnnouncement {
                        network_name,
                        endpoint_id,
                    },
                ),
                RouterOut::SendEnvelope(peer, msg) => (
                    peer,
                    WireMessage::PeerMessage {
                        network_name: msg.network_name,
                        endpoint_id: msg.endpoint_id,
                        source: msg.source,
                        kind: msg.kind,
                        body: msg.body,
                    },
                ),
            };
            send_to_peer(&mesh, peer, wire).await;
        }
    });
}

/// Ships every outbound discovery event to the right peer connection.
fn spawn_discovery_forwarder(mut discovery: Broker<DiscoveryIn, DiscoveryOut>, mesh: MeshClient) {
    spawn_local(async move {
        let (mut tap, _) = match discovery.get_tap_out().await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("couldn't tap discovery output: {e:#}");
                return;
            }
        };
        while let Some(event) = tap.recv().await {
            if let DiscoveryOut::SendToPeer(peer, event_type, descriptor) = event {
                send_to_peer(
                    &mesh,
                    peer,
                    WireMessage::ServiceDiscoveryEvent {
                        event_type,
                        descriptor,
                    },
                )
                .await;
            }
        }
    });
}

/// On every lifecycle state change, folds the new `ParticipantStatus` into
/// this participant's own monitor and broadcasts it to every peer's monitor.
/// Also stands in for the embedding application's handler callbacks: since
/// `Participant` registers no real comm-ready/starting/stop/shutdown
/// handlers of its own, every `Invoke*Handler` request completes
/// immediately, the way a no-op handler would.
fn spawn_lifecycle_forwarder(
    own_name: String,
    mut lifecycle: Broker<LifecycleIn, LifecycleOut>,
    mut monitor: Broker<MonitorIn, MonitorOut>,
    mesh: MeshClient,
) {
    spawn_local(async move {
        let (mut tap, _) = match lifecycle.get_tap_out().await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("couldn't tap lifecycle output: {e:#}");
                return;
            }
        };
        while let Some(event) = tap.recv().await {
            match event {
                LifecycleOut::StateChanged(state) => {
                    let status = ParticipantStatus {
                        participant_name: own_name.clone(),
                        state,
                        enter_reason: format!("{state:?}"),
                        enter_timestamp: now(),
                        refresh_timestamp: now(),
                    };
                    let _ = monitor.emit_msg_in(MonitorIn::ParticipantStatus(status.clone()));
                    for id in mesh.peer_ids().await {
                        send_to_peer(
                            &mesh,
                            id,
                            WireMessage::ParticipantStatusUpdate(status.clone()),
                        )
                        .await;
                    }
                }
                LifecycleOut::InvokeCommReadyHandler => {
                    let _ = lifecycle.emit_msg_in(LifecycleIn::CommReadyHandlerDone);
                }
                LifecycleOut::InvokeStartingHandler => {
                    let _ = lifecycle.emit_msg_in(LifecycleIn::StartingHandlerDone);
                }
                LifecycleOut::InvokeStopHandler => {
                    let _ = lifecycle.emit_msg_in(LifecycleIn::StopHandlerDone);
                }
                LifecycleOut::InvokeShutdownHandler => {
                    let _ = lifecycle.emit_msg_in(LifecycleIn::ShutdownHandlerDone);
                }
                LifecycleOut::InvalidTransitionIgnored(state, reason) => {
                    log::warn!("lifecycle: ignored transition from {state:?}: {reason}");
                }
            }
        }
    });
}

/// Feeds the local monitor's aggregate system-state changes back into the
/// local lifecycle FSM (the coordinated-start/stop path waits on these).
/// Purely intra-process - never touches the wire.
fn spawn_monitor_forwarder(
    mut monitor: Broker<MonitorIn, MonitorOut>,
    mut lifecycle: Broker<LifecycleIn, LifecycleOut>,
) {
    spawn_local(async move {
        let (mut tap, _) = match monitor.get_tap_out().await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("couldn't tap monitor output: {e:#}");
                return;
            }
        };
        while let Some(MonitorOut::SystemStateChanged(state)) = tap.recv().await {
            let _ = lifecycle.emit_msg_in(LifecycleIn::SystemStateChanged(state));
        }
    });
}

/// Broadcasts every step this participant commits to, to every peer's
/// time-sync service.
fn spawn_timesync_forwarder(mut timesync: Broker<TimeSyncIn, TimeSyncOut>, mesh: MeshClient) {
    spawn_local(async move {
        let (mut tap, _) = match timesync.get_tap_out().await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("couldn't tap timesync output: {e:#}");
                return;
            }
        };
        while let Some(event) = tap.recv().await {
            if let TimeSyncOut::Broadcast(task) = event {
                for id in mesh.peer_ids().await {
                    send_to_peer(&mesh, id, WireMessage::NextSimTaskAnnouncement(task)).await;
                }
            }
        }
    });
}

async fn send_to_peer(mesh: &MeshClient, peer: ParticipantId, wire: WireMessage) {
    let Some(mut conn) = mesh.peer_conn(peer).await else {
        log::warn!("dropping message to a peer not in the mesh");
        return;
    };
    if let Err(e) = conn.emit_msg_in(TransportIn::Send(Bytes::from(wire.encode()))) {
        log::warn!("failed to queue outbound frame: {e:#}");
        return;
    }
    let _ = conn.emit_msg_in(TransportIn::Flush);
}
