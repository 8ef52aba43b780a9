//! Swarm construction for the node's P2P transport (C10, the external
//! collaborator summarized in §6): a combined libp2p behaviour providing
//! Kademlia peer discovery, the gossipsub pub/sub bus C9's topics ride on,
//! and the two request/response stream protocols the upload and download
//! engines use to send and fetch segment containers.
//!
//! Grounded in the reference node's `MyBehaviour`/`SwarmBuilder` setup
//! (Kademlia + TCP/noise/yamux transport), extended with `gossipsub` and
//! two `request_response::cbor::Behaviour` instances the way the wider
//! corpus composes multi-protocol behaviours (see e.g. `sven-p2p`'s
//! `P2pBehaviour` and the kernel networking crate's `SyncBehaviour`).

use libp2p::kad::{store::MemoryStore, Behaviour as Kademlia, Event as KademliaEvent};
use libp2p::request_response::{self, cbor, ProtocolSupport};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identity, noise, tcp, yamux, PeerId, Swarm, SwarmBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;

/// Request carried by `defs@stream:file/segment/send/<version>`: the
/// sending peer hands over a full container file for the recipient to
/// persist as a `FileSegmentStorage` row. The file-level fields (`name`
/// through `upload_time`) aren't present in the container itself — only the
/// owning `UploadFileRecord` carries them — so the sender attaches them here
/// for the holder to answer search requests without contacting the owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentSendRequest {
    pub file_id: String,
    pub segment_id: String,
    pub container_bytes: Vec<u8>,
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub content_type: String,
    pub sha256: [u8; 32],
    pub upload_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentSendResponse {
    pub accepted: bool,
    pub message: String,
}

/// Request carried by `defs@stream:file/segment/fetch/<version>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentFetchRequest {
    pub file_id: String,
    pub segment_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SegmentFetchResponse {
    Found { container_bytes: Vec<u8> },
    /// The peer no longer holds this segment (evicted, never had it, or the
    /// `shared` flag excludes this requester).
    NotFound,
}

const SEND_PROTOCOL: &str = "/defs@stream:file/segment/send/v1";
const FETCH_PROTOCOL: &str = "/defs@stream:file/segment/fetch/v1";

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "MeshBehaviourEvent")]
pub struct MeshBehaviour {
    pub kad: Kademlia<MemoryStore>,
    pub gossipsub: gossipsub::Behaviour,
    pub segment_send: cbor::Behaviour<SegmentSendRequest, SegmentSendResponse>,
    pub segment_fetch: cbor::Behaviour<SegmentFetchRequest, SegmentFetchResponse>,
}

#[derive(Debug)]
pub enum MeshBehaviourEvent {
    Kad(KademliaEvent),
    Gossipsub(gossipsub::Event),
    SegmentSend(request_response::Event<SegmentSendRequest, SegmentSendResponse>),
    SegmentFetch(request_response::Event<SegmentFetchRequest, SegmentFetchResponse>),
}

impl From<KademliaEvent> for MeshBehaviourEvent {
    fn from(e: KademliaEvent) -> Self {
        MeshBehaviourEvent::Kad(e)
    }
}
impl From<gossipsub::Event> for MeshBehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        MeshBehaviourEvent::Gossipsub(e)
    }
}
impl From<request_response::Event<SegmentSendRequest, SegmentSendResponse>> for MeshBehaviourEvent {
    fn from(e: request_response::Event<SegmentSendRequest, SegmentSendResponse>) -> Self {
        MeshBehaviourEvent::SegmentSend(e)
    }
}
impl From<request_response::Event<SegmentFetchRequest, SegmentFetchResponse>>
    for MeshBehaviourEvent
{
    fn from(e: request_response::Event<SegmentFetchRequest, SegmentFetchResponse>) -> Self {
        MeshBehaviourEvent::SegmentFetch(e)
    }
}

/// Build and configure a swarm using this node's identity and `config`.
/// Does not listen or dial; callers (the network actor) own the event loop.
pub fn build_swarm(
    local_key: identity::Keypair,
    config: &Config,
) -> Result<Swarm<MeshBehaviour>, Box<dyn std::error::Error>> {
    let swarm = SwarmBuilder::with_existing_identity(local_key)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();

            let store = MemoryStore::new(peer_id);
            let mut kad = Kademlia::new(peer_id, store);
            kad.set_mode(Some(libp2p::kad::Mode::Server));

            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .build()
                    .expect("valid gossipsub config"),
            )
            .expect("valid gossipsub behaviour");

            let rr_config =
                request_response::Config::default().with_request_timeout(Duration::from_secs(60));
            let segment_send = cbor::Behaviour::new(
                [(SEND_PROTOCOL, ProtocolSupport::Full)],
                rr_config.clone(),
            );
            let segment_fetch =
                cbor::Behaviour::new([(FETCH_PROTOCOL, ProtocolSupport::Full)], rr_config);

            Ok(MeshBehaviour {
                kad,
                gossipsub,
                segment_send,
                segment_fetch,
            })
        })?
        .with_swarm_config(|c| {
            c.with_idle_connection_timeout(Duration::from_secs(
                config.network.connection_timeout_secs,
            ))
        })
        .build();

    Ok(swarm)
}

pub fn local_peer_id(swarm: &Swarm<MeshBehaviour>) -> PeerId {
    *swarm.local_peer_id()
}
