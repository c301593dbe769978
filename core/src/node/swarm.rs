// libp2p swarm setup — the running network node
//
// The Swarm is owned by a spawned event loop. Everything else talks to it
// through a cloneable SwarmHandle that sends SwarmCommands and waits on a
// reply channel. Raw streams bypass the loop: libp2p-stream's Control opens
// and accepts them directly.

use super::behaviour::{NodeBehaviour, NodeBehaviourEvent};
use super::NodeError;
use futures::StreamExt;
use libp2p::{
    core::transport::ListenerId,
    identify,
    identity::Keypair,
    kad,
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        ConnectionId, SwarmEvent,
    },
    Multiaddr, PeerId,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Commands that can be sent to the swarm task
#[derive(Debug)]
pub enum SwarmCommand {
    /// Dial a peer, resolving once a connection is established or the dial failed
    Dial {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Run a DHT lookup for a peer, resolving when the query finishes
    FindPeer {
        peer_id: PeerId,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Start listening, resolving to the first concrete listen address
    Listen {
        addr: Multiaddr,
        reply: mpsc::Sender<Result<Multiaddr, String>>,
    },
    /// Get all addresses we currently listen on
    GetListenAddrs { reply: mpsc::Sender<Vec<Multiaddr>> },
    /// Close every connection to a peer, resolving once the last one is gone
    Disconnect {
        peer_id: PeerId,
        reply: mpsc::Sender<()>,
    },
    /// Add a peer address to the DHT routing table
    AddKadAddress {
        peer_id: PeerId,
        addr: Multiaddr,
    },
    /// Number of peers in the DHT routing table
    GetRoutingPeers { reply: mpsc::Sender<usize> },
    /// Start a DHT routing table refresh
    RefreshRouting {
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Shutdown the swarm
    Shutdown,
}

/// Handle to communicate with the running swarm task
#[derive(Clone)]
pub struct SwarmHandle {
    command_tx: mpsc::Sender<SwarmCommand>,
    control: libp2p_stream::Control,
    connections: Arc<RwLock<HashMap<PeerId, Multiaddr>>>,
    local_peer_id: PeerId,
}

impl SwarmHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Stream control for opening and accepting protocol streams
    pub fn control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    /// Remote address of our current connection to a peer
    pub fn remote_address(&self, peer_id: &PeerId) -> Option<Multiaddr> {
        self.connections.read().get(peer_id).cloned()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connections.read().contains_key(peer_id)
    }

    /// Dial a peer on the given addresses plus whatever the behaviours know
    pub async fn dial(&self, peer_id: PeerId, addrs: Vec<Multiaddr>) -> Result<(), NodeError> {
        self.request(|reply| SwarmCommand::Dial {
            peer_id,
            addrs,
            reply,
        })
        .await?
        .map_err(|reason| NodeError::Dial { peer_id, reason })
    }

    /// Look a peer up in the DHT
    pub async fn find_peer(&self, peer_id: PeerId) -> Result<(), NodeError> {
        self.request(|reply| SwarmCommand::FindPeer { peer_id, reply })
            .await?
            .map_err(|reason| NodeError::Lookup { peer_id, reason })
    }

    /// Start listening on an address
    pub async fn listen(&self, addr: Multiaddr) -> Result<Multiaddr, NodeError> {
        let requested = addr.clone();
        self.request(|reply| SwarmCommand::Listen { addr, reply })
            .await?
            .map_err(|reason| NodeError::Listen {
                addr: requested,
                reason,
            })
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, NodeError> {
        self.request(|reply| SwarmCommand::GetListenAddrs { reply })
            .await
    }

    /// Tear down all connections to a peer, aborting every stream on them
    pub async fn disconnect(&self, peer_id: PeerId) -> Result<(), NodeError> {
        self.request(|reply| SwarmCommand::Disconnect { peer_id, reply })
            .await
    }

    pub async fn add_kad_address(&self, peer_id: PeerId, addr: Multiaddr) -> Result<(), NodeError> {
        self.command_tx
            .send(SwarmCommand::AddKadAddress { peer_id, addr })
            .await
            .map_err(|_| NodeError::NotRunning)
    }

    pub async fn routing_peers(&self) -> Result<usize, NodeError> {
        self.request(|reply| SwarmCommand::GetRoutingPeers { reply })
            .await
    }

    pub async fn refresh_routing(&self) -> Result<(), NodeError> {
        self.request(|reply| SwarmCommand::RefreshRouting { reply })
            .await?
            .map_err(NodeError::Routing)
    }

    /// Shut down the swarm
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.command_tx
            .send(SwarmCommand::Shutdown)
            .await
            .map_err(|_| NodeError::NotRunning)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(mpsc::Sender<T>) -> SwarmCommand,
    ) -> Result<T, NodeError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| NodeError::NotRunning)?;

        reply_rx.recv().await.ok_or(NodeError::NotRunning)
    }
}

/// Build the libp2p swarm and spawn its event loop, returning a handle.
pub fn start_swarm(
    keypair: Keypair,
    routing: bool,
    idle_connection_timeout: Duration,
) -> Result<SwarmHandle, NodeError> {
    let local_peer_id = keypair.public().to_peer_id();

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )
        .map_err(|e| NodeError::Transport(e.to_string()))?
        .with_quic()
        .with_dns()
        .map_err(|e| NodeError::Transport(e.to_string()))?
        .with_behaviour(|key| NodeBehaviour::new(key, routing))
        .map_err(|e| NodeError::Transport(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_connection_timeout))
        .build();

    let control = swarm.behaviour().stream.new_control();
    let connections: Arc<RwLock<HashMap<PeerId, Multiaddr>>> = Arc::default();

    let (command_tx, mut command_rx) = mpsc::channel::<SwarmCommand>(256);
    let handle = SwarmHandle {
        command_tx,
        control,
        connections: connections.clone(),
        local_peer_id,
    };

    // Replies waiting on swarm events
    let mut pending_dials: HashMap<ConnectionId, mpsc::Sender<Result<(), String>>> =
        HashMap::new();
    let mut pending_lookups: HashMap<kad::QueryId, mpsc::Sender<Result<(), String>>> =
        HashMap::new();
    let mut pending_listens: HashMap<ListenerId, mpsc::Sender<Result<Multiaddr, String>>> =
        HashMap::new();
    let mut pending_disconnects: HashMap<PeerId, Vec<mpsc::Sender<()>>> = HashMap::new();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, connection_id, .. } => {
                            debug!("Connected to {} via {}", peer_id, endpoint.get_remote_address());
                            connections.write().insert(peer_id, endpoint.get_remote_address().clone());

                            if let Some(reply) = pending_dials.remove(&connection_id) {
                                let _ = reply.send(Ok(())).await;
                            }
                        }

                        SwarmEvent::OutgoingConnectionError { connection_id, peer_id, error } => {
                            debug!("Dial to {:?} failed: {}", peer_id, error);
                            if let Some(reply) = pending_dials.remove(&connection_id) {
                                let _ = reply.send(Err(error.to_string())).await;
                            }
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            debug!("Disconnected from {}", peer_id);
                            if num_established == 0 {
                                connections.write().remove(&peer_id);
                                for reply in pending_disconnects.remove(&peer_id).unwrap_or_default() {
                                    let _ = reply.send(()).await;
                                }
                            }
                        }

                        SwarmEvent::NewListenAddr { listener_id, address } => {
                            info!("Listening on {}/p2p/{}", address, local_peer_id);
                            if let Some(reply) = pending_listens.remove(&listener_id) {
                                let _ = reply.send(Ok(address)).await;
                            }
                        }

                        SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                            if let Some(reply) = pending_listens.remove(&listener_id) {
                                let reason = match reason {
                                    Ok(()) => "listener closed".to_string(),
                                    Err(e) => e.to_string(),
                                };
                                let _ = reply.send(Err(reason)).await;
                            }
                        }

                        SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. }
                        )) => {
                            // Only DHT servers belong in the routing table
                            if info.protocols.contains(&kad::PROTOCOL_NAME) {
                                if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                                    for addr in info.listen_addrs {
                                        kademlia.add_address(&peer_id, addr);
                                    }
                                }
                            }
                        }

                        SwarmEvent::Behaviour(NodeBehaviourEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed { id, result, step, .. }
                        )) => {
                            match result {
                                kad::QueryResult::GetClosestPeers(result) if step.last => {
                                    if let Err(e) = &result {
                                        debug!("Closest peers query ended early: {:?}", e);
                                    }
                                    if let Some(reply) = pending_lookups.remove(&id) {
                                        let _ = reply.send(Ok(())).await;
                                    }
                                }
                                kad::QueryResult::Bootstrap(result) => {
                                    debug!("Routing table refresh step: {:?}", result);
                                }
                                _ => {}
                            }
                        }

                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("All swarm handles dropped");
                        break;
                    };

                    match command {
                        SwarmCommand::Dial { peer_id, addrs, reply } => {
                            if swarm.is_connected(&peer_id) {
                                let _ = reply.send(Ok(())).await;
                            } else {
                                let opts = DialOpts::peer_id(peer_id)
                                    .addresses(addrs)
                                    .extend_addresses_through_behaviour()
                                    .condition(PeerCondition::Always)
                                    .build();
                                let connection_id = opts.connection_id();

                                match swarm.dial(opts) {
                                    Ok(()) => {
                                        pending_dials.insert(connection_id, reply);
                                    }
                                    Err(e) => {
                                        let _ = reply.send(Err(e.to_string())).await;
                                    }
                                }
                            }
                        }

                        SwarmCommand::FindPeer { peer_id, reply } => {
                            match swarm.behaviour_mut().kademlia.as_mut() {
                                Some(kademlia) => {
                                    let query_id = kademlia.get_closest_peers(peer_id);
                                    pending_lookups.insert(query_id, reply);
                                }
                                None => {
                                    let _ = reply.send(Err(NodeError::RoutingDisabled.to_string())).await;
                                }
                            }
                        }

                        SwarmCommand::Listen { addr, reply } => {
                            match swarm.listen_on(addr) {
                                Ok(listener_id) => {
                                    pending_listens.insert(listener_id, reply);
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(e.to_string())).await;
                                }
                            }
                        }

                        SwarmCommand::GetListenAddrs { reply } => {
                            let addrs: Vec<Multiaddr> = swarm.listeners().cloned().collect();
                            let _ = reply.send(addrs).await;
                        }

                        SwarmCommand::Disconnect { peer_id, reply } => {
                            if swarm.disconnect_peer_id(peer_id).is_ok() {
                                pending_disconnects.entry(peer_id).or_default().push(reply);
                            } else {
                                let _ = reply.send(()).await;
                            }
                        }

                        SwarmCommand::AddKadAddress { peer_id, addr } => {
                            if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                                kademlia.add_address(&peer_id, addr);
                            }
                        }

                        SwarmCommand::GetRoutingPeers { reply } => {
                            let peers = swarm
                                .behaviour_mut()
                                .kademlia
                                .as_mut()
                                .map_or(0, |kademlia| {
                                    kademlia.kbuckets().map(|bucket| bucket.num_entries()).sum()
                                });
                            let _ = reply.send(peers).await;
                        }

                        SwarmCommand::RefreshRouting { reply } => {
                            let result = match swarm.behaviour_mut().kademlia.as_mut() {
                                Some(kademlia) => kademlia.bootstrap().map(|_| ()).map_err(|e| e.to_string()),
                                None => Err(NodeError::RoutingDisabled.to_string()),
                            };
                            let _ = reply.send(result).await;
                        }

                        SwarmCommand::Shutdown => {
                            info!("Swarm shutting down");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(handle)
}
