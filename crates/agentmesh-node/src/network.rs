use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    StreamExt,
};
use libp2p::{
    gossipsub, identify, kad, mdns, noise, ping, request_response,
    swarm::{dial_opts::DialOpts, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
};

use agentmesh_protocol::constants::{
    BILATERAL_PROTOCOL, IDENTIFY_PROTOCOL, MAX_MESSAGE_SIZE, TOPIC_TRUST_FILTERS,
};

use crate::transport::{Transport, TransportEvent};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ============================================================================
// Combined behaviour
// ============================================================================

#[derive(NetworkBehaviour)]
pub struct AgentMeshBehaviour {
    /// Trust filter gossip.
    pub gossipsub:        gossipsub::Behaviour,
    pub kademlia:         kad::Behaviour<kad::store::MemoryStore>,
    pub mdns:             mdns::tokio::Behaviour,
    pub identify:         identify::Behaviour,
    /// Handshake and application messages between two peers.
    pub request_response: request_response::Behaviour<AgentMeshCodec>,
    /// RTT samples for latency zones.
    pub ping:             ping::Behaviour,
}

// ============================================================================
// Bilateral codec
// ============================================================================

/// One CBOR `WireMessage` per request, framed by a big-endian u32 length.
/// Replies carry no body; closing the stream is the acknowledgement.
#[derive(Clone, Default)]
pub struct AgentMeshCodec;

#[async_trait]
impl request_response::Codec for AgentMeshCodec {
    type Protocol = StreamProtocol;
    type Request  = Vec<u8>;
    type Response = ();

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Vec<u8>>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io, MAX_MESSAGE_SIZE).await
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, _: &mut T) -> io::Result<()>
    where
        T: AsyncRead + Unpin + Send,
    {
        Ok(())
    }

    async fn write_request<T>(&mut self, _: &Self::Protocol, io: &mut T, req: Vec<u8>) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &req).await?;
        io.close().await
    }

    async fn write_response<T>(&mut self, _: &Self::Protocol, io: &mut T, _: ()) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.close().await
    }
}

async fn read_frame<T: AsyncRead + Unpin>(io: &mut T, limit: usize) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    io.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes outside 1..={limit}"),
        ));
    }
    let mut body = Vec::with_capacity(len);
    io.take(len as u64).read_to_end(&mut body).await?;
    if body.len() != len {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(body)
}

async fn write_frame<T: AsyncWrite + Unpin>(io: &mut T, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    io.write_all(&frame).await?;
    io.flush().await
}

// ============================================================================
// Swarm builder
// ============================================================================

/// Build the libp2p swarm, subscribe to the trust filter topic and start
/// listening on TCP plus the matching QUIC address.
pub fn build_swarm(
    keypair:         libp2p::identity::Keypair,
    listen_addr:     Multiaddr,
    bootstrap_peers: &[Multiaddr],
) -> anyhow::Result<Swarm<AgentMeshBehaviour>> {
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_quic()
        .with_dns()?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();

            let gossip_cfg = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(10))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .max_transmit_size(MAX_MESSAGE_SIZE)
                .build()
                .map_err(|e| Box::new(e) as BoxError)?;

            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossip_cfg,
            )
            .map_err(BoxError::from)?;

            let mut kademlia =
                kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));
            kademlia.set_mode(Some(kad::Mode::Server));

            let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                .map_err(|e| Box::new(e) as BoxError)?;

            let identify = identify::Behaviour::new(identify::Config::new(
                IDENTIFY_PROTOCOL.to_string(),
                key.public(),
            ));

            let request_response = request_response::Behaviour::<AgentMeshCodec>::new(
                [(
                    StreamProtocol::new(BILATERAL_PROTOCOL),
                    request_response::ProtocolSupport::Full,
                )],
                request_response::Config::default(),
            );

            let ping = ping::Behaviour::new(ping::Config::new());

            Ok(AgentMeshBehaviour {
                gossipsub,
                kademlia,
                mdns,
                identify,
                request_response,
                ping,
            })
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    swarm
        .behaviour_mut()
        .gossipsub
        .subscribe(&gossipsub::IdentTopic::new(TOPIC_TRUST_FILTERS))?;

    for addr in bootstrap_peers {
        if let Some(peer_id) = peer_id_of(addr) {
            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
        }
    }

    swarm.listen_on(listen_addr.clone())?;

    if let Some(quic_addr) = quic_twin(&listen_addr) {
        match swarm.listen_on(quic_addr.clone()) {
            Ok(_)  => tracing::info!("Also listening on QUIC: {quic_addr}"),
            Err(e) => tracing::warn!("QUIC listen failed for {quic_addr}: {e}"),
        }
    }

    Ok(swarm)
}

fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::P2p(pid) => Some(pid),
        _ => None,
    })
}

/// The UDP/QUIC address sharing the TCP listener's port, if it has one.
fn quic_twin(tcp_addr: &Multiaddr) -> Option<Multiaddr> {
    use libp2p::multiaddr::Protocol;
    if !tcp_addr.iter().any(|p| matches!(p, Protocol::Tcp(_))) {
        return None;
    }
    Some(
        tcp_addr
            .iter()
            .flat_map(|p| match p {
                Protocol::Tcp(port) => vec![Protocol::Udp(port), Protocol::QuicV1],
                other => vec![other],
            })
            .collect(),
    )
}

fn parse_peer(peer: &str) -> anyhow::Result<PeerId> {
    peer.parse::<PeerId>()
        .map_err(|e| anyhow::anyhow!("invalid peer id {peer}: {e}"))
}

// ============================================================================
// Transport over the swarm
// ============================================================================

/// Maps swarm events onto `TransportEvent`s and node commands onto swarm
/// calls.
pub struct SwarmTransport {
    swarm:       Swarm<AgentMeshBehaviour>,
    trust_topic: gossipsub::IdentTopic,
    pending:     VecDeque<TransportEvent>,
}

impl SwarmTransport {
    pub fn new(swarm: Swarm<AgentMeshBehaviour>) -> Self {
        Self {
            swarm,
            trust_topic: gossipsub::IdentTopic::new(TOPIC_TRUST_FILTERS),
            pending:     VecDeque::new(),
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<AgentMeshBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {address}");
            }
            SwarmEvent::ConnectionEstablished { peer_id, num_established, .. } => {
                if num_established.get() == 1 {
                    self.pending.push_back(TransportEvent::Connected(peer_id.to_string()));
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    self.pending.push_back(TransportEvent::Disconnected(peer_id.to_string()));
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
                tracing::debug!("Outgoing connection error to {peer_id}: {error}");
                self.pending.push_back(TransportEvent::DialFailed(peer_id.to_string()));
            }
            SwarmEvent::Behaviour(event) => self.on_behaviour_event(event),
            _ => {}
        }
    }

    fn on_behaviour_event(&mut self, event: AgentMeshBehaviourEvent) {
        match event {
            AgentMeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => {
                if message.topic != self.trust_topic.hash() {
                    return;
                }
                let source = message.source.unwrap_or(propagation_source);
                self.pending.push_back(TransportEvent::Gossip {
                    source: source.to_string(),
                    data:   message.data,
                });
            }
            AgentMeshBehaviourEvent::Gossipsub(_) => {}

            AgentMeshBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                let mut by_peer: BTreeMap<PeerId, Vec<String>> = BTreeMap::new();
                for (peer_id, addr) in peers {
                    tracing::debug!("mDNS discovered {peer_id} at {addr}");
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                    by_peer.entry(peer_id).or_default().push(addr.to_string());
                }
                for (peer, addrs) in by_peer {
                    self.pending.push_back(TransportEvent::Discovered { peer: peer.to_string(), addrs });
                }
            }
            AgentMeshBehaviourEvent::Mdns(_) => {}

            AgentMeshBehaviourEvent::Kademlia(kad::Event::RoutingUpdated { peer, addresses, .. }) => {
                self.pending.push_back(TransportEvent::Discovered {
                    peer:  peer.to_string(),
                    addrs: addresses.iter().map(ToString::to_string).collect(),
                });
            }
            AgentMeshBehaviourEvent::Kademlia(_) => {}

            AgentMeshBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::debug!("Identified {peer_id}: agent={}", info.agent_version);
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                }
            }
            AgentMeshBehaviourEvent::Identify(_) => {}

            AgentMeshBehaviourEvent::RequestResponse(request_response::Event::Message {
                peer,
                message,
                ..
            }) => match message {
                request_response::Message::Request { request, channel, .. } => {
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .request_response
                        .send_response(channel, ());
                    self.pending.push_back(TransportEvent::Message {
                        peer: peer.to_string(),
                        data: request,
                    });
                }
                request_response::Message::Response { .. } => {
                    tracing::trace!("Bilateral delivery acknowledged by {peer}");
                }
            },
            AgentMeshBehaviourEvent::RequestResponse(request_response::Event::OutboundFailure {
                peer, error, ..
            }) => {
                tracing::warn!("Bilateral outbound failure to {peer}: {error}");
            }
            AgentMeshBehaviourEvent::RequestResponse(request_response::Event::InboundFailure {
                peer, error, ..
            }) => {
                tracing::debug!("Bilateral inbound failure from {peer}: {error}");
            }
            AgentMeshBehaviourEvent::RequestResponse(_) => {}

            AgentMeshBehaviourEvent::Ping(ping::Event { peer, result: Ok(rtt), .. }) => {
                self.pending.push_back(TransportEvent::RoundTrip { peer: peer.to_string(), rtt });
            }
            AgentMeshBehaviourEvent::Ping(_) => {}
        }
    }
}

#[async_trait]
impl Transport for SwarmTransport {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let event = self.swarm.next().await?;
            self.on_swarm_event(event);
        }
    }

    fn dial(&mut self, peer: &str, addrs: &[String]) -> anyhow::Result<()> {
        let peer_id = parse_peer(peer)?;
        let addresses: Vec<Multiaddr> = addrs.iter().filter_map(|a| a.parse().ok()).collect();
        let opts = DialOpts::peer_id(peer_id).addresses(addresses).build();
        self.swarm
            .dial(opts)
            .map_err(|e| anyhow::anyhow!("dial {peer}: {e}"))
    }

    fn start_discovery(&mut self) {
        if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
            tracing::warn!("Kademlia bootstrap not started: {e}");
        }
    }

    fn send(&mut self, peer: &str, data: Vec<u8>) -> anyhow::Result<()> {
        let peer_id = parse_peer(peer)?;
        self.swarm.behaviour_mut().request_response.send_request(&peer_id, data);
        Ok(())
    }

    fn publish(&mut self, topic: &str, data: Vec<u8>) -> anyhow::Result<()> {
        self.swarm
            .behaviour_mut()
            .gossipsub
            .publish(gossipsub::IdentTopic::new(topic), data)
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("publish on {topic}: {e}"))
    }

    fn disconnect(&mut self, peer: &str) {
        if let Ok(peer_id) = parse_peer(peer) {
            let _ = self.swarm.disconnect_peer_id(peer_id);
        }
    }

    fn is_connected(&self, peer: &str) -> bool {
        parse_peer(peer).is_ok_and(|p| self.swarm.is_connected(&p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[test]
    fn quic_listener_mirrors_tcp_port() {
        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/9100".parse().unwrap();
        let quic = quic_twin(&tcp).unwrap();
        assert_eq!(quic.to_string(), "/ip4/127.0.0.1/udp/9100/quic-v1");

        let udp: Multiaddr = "/ip4/127.0.0.1/udp/9100".parse().unwrap();
        assert!(quic_twin(&udp).is_none());
    }

    #[tokio::test]
    async fn frames_are_length_checked() {
        let mut buf = Cursor::new(Vec::new());
        write_frame(&mut buf, b"hello").await.unwrap();
        assert_eq!(&buf.get_ref()[..4], &5u32.to_be_bytes());

        buf.set_position(0);
        assert_eq!(read_frame(&mut buf, 16).await.unwrap(), b"hello");

        buf.set_position(0);
        let err = read_frame(&mut buf, 4).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // Header promises more than the stream holds.
        let mut short = Cursor::new([0, 0, 0, 9, b'h', b'i'].to_vec());
        let err = read_frame(&mut short, 16).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut empty = Cursor::new(0u32.to_be_bytes().to_vec());
        assert!(read_frame(&mut empty, 16).await.is_err());
    }

    #[test]
    fn bootstrap_peer_id_is_extracted() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/9100/p2p/12D3KooWLudabD69eAYzfoZMVRqJb8XHBLDKsQvRn6Q9hTQqvMuY"
            .parse()
            .unwrap();
        assert_eq!(
            peer_id_of(&addr).map(|p| p.to_string()).as_deref(),
            Some("12D3KooWLudabD69eAYzfoZMVRqJb8XHBLDKsQvRn6Q9hTQqvMuY"),
        );
        assert!(peer_id_of(&"/ip4/10.0.0.1/tcp/9100".parse().unwrap()).is_none());
    }
}
