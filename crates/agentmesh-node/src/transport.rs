use std::time::Duration;

use async_trait::async_trait;

/// Everything the node needs to hear from the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Discovered { peer: String, addrs: Vec<String> },
    Connected(String),
    Disconnected(String),
    /// Frame on the bilateral channel of a connected peer.
    Message { peer: String, data: Vec<u8> },
    /// Payload published on the trust filter topic by `source`.
    Gossip { source: String, data: Vec<u8> },
    DialFailed(String),
    RoundTrip { peer: String, rtt: Duration },
}

/// Session layer seam. The libp2p swarm implements it in `network`; tests
/// use an in-memory fake.
#[async_trait]
pub trait Transport: Send {
    /// Next event, or `None` once the transport has shut down.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    fn dial(&mut self, peer: &str, addrs: &[String]) -> anyhow::Result<()>;

    /// Kick off routing-table discovery once bootstrap peers are dialed.
    fn start_discovery(&mut self) {}

    /// Send one encoded wire message to a connected peer.
    fn send(&mut self, peer: &str, data: Vec<u8>) -> anyhow::Result<()>;

    fn publish(&mut self, topic: &str, data: Vec<u8>) -> anyhow::Result<()>;

    fn disconnect(&mut self, peer: &str);

    fn is_connected(&self, peer: &str) -> bool;
}
