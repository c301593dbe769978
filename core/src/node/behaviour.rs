// Combined NetworkBehaviour for a p2pcat node
//
// - stream: raw protocol streams (the relayed byte channel)
// - kademlia: optional DHT client for peer routing
// - identify: exchange listen addresses so routing can learn about peers

use libp2p::{
    identify, kad,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
};

/// Version string announced over identify.
pub const AGENT_PROTOCOL_VERSION: &str = "/p2pcat/1.0.0";

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    /// Inbound and outbound protocol streams
    pub stream: libp2p_stream::Behaviour,
    /// DHT client, present only when peer routing is enabled
    pub kademlia: Toggle<kad::Behaviour<kad::store::MemoryStore>>,
    /// Peer identification
    pub identify: identify::Behaviour,
}

impl NodeBehaviour {
    pub fn new(keypair: &libp2p::identity::Keypair, routing: bool) -> Self {
        let peer_id = keypair.public().to_peer_id();

        // We only query the DHT, never serve it.
        let kademlia = routing.then(|| {
            let mut kademlia =
                kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));
            kademlia.set_mode(Some(kad::Mode::Client));
            kademlia
        });

        let identify = identify::Behaviour::new(identify::Config::new(
            AGENT_PROTOCOL_VERSION.to_string(),
            keypair.public(),
        ));

        Self {
            stream: libp2p_stream::Behaviour::new(),
            kademlia: Toggle::from(kademlia),
            identify,
        }
    }
}
