//! Consensus traffic over UDP.
//!
//! One socket per node carries every peer message, one protobuf
//! [`Packet`](junta_proto::peer::Packet) per datagram. Loss, duplication
//! and reordering are left to the engine, which tolerates all three.

use crate::convert;
use junta_common::{NodeId, TransportError};
use junta_paxos::{Envelope, Sink, Source};
use junta_proto::peer::Packet;
use prost::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

/// Largest payload a UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Shared map from node id to peer address.
///
/// The node rewrites it from `/junta/members/*` as membership changes;
/// the sink reads it on every send.
#[derive(Clone, Default)]
pub struct PeerSet {
    inner: Arc<RwLock<HashMap<NodeId, SocketAddr>>>,
}

impl std::fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSet").finish_non_exhaustive()
    }
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: NodeId, addr: SocketAddr) {
        self.inner.write().await.insert(id, addr);
    }

    pub async fn remove(&self, id: &NodeId) {
        self.inner.write().await.remove(id);
    }

    pub async fn get(&self, id: &NodeId) -> Option<SocketAddr> {
        self.inner.read().await.get(id).copied()
    }

    /// Replace the whole set.
    pub async fn replace(&self, peers: HashMap<NodeId, SocketAddr>) {
        *self.inner.write().await = peers;
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Bind the peer socket and split it into its sending and receiving ends.
pub async fn bind(
    local_id: NodeId,
    addr: SocketAddr,
    peers: PeerSet,
) -> Result<(UdpSink, UdpSource), TransportError> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    tracing::info!("peer socket bound on {}", socket.local_addr()?);
    Ok((
        UdpSink {
            socket: socket.clone(),
            peers,
            local_id,
        },
        UdpSource {
            socket,
            buf: vec![0u8; MAX_DATAGRAM],
        },
    ))
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub struct UdpSink {
    socket: Arc<UdpSocket>,
    peers: PeerSet,
    local_id: NodeId,
}

impl std::fmt::Debug for UdpSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSink")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl UdpSink {
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait::async_trait]
impl Sink for UdpSink {
    async fn send(&self, to: &NodeId, env: Envelope) -> Result<(), TransportError> {
        let Some(addr) = self.peers.get(to).await else {
            junta_metrics::metrics()
                .messages_dropped
                .with_label_values(&["unknown_peer"])
                .inc();
            return Err(TransportError::UnknownPeer(*to));
        };
        let kind = env.msg.kind();
        let bytes = convert::envelope_to_proto(env).encode_to_vec();
        if bytes.len() > MAX_DATAGRAM {
            junta_metrics::metrics()
                .messages_dropped
                .with_label_values(&["oversize"])
                .inc();
            tracing::warn!("{} to {} is {} bytes; too large for one datagram", kind, to, bytes.len());
            return Err(TransportError::Encode(format!("{} bytes", bytes.len())));
        }
        self.socket.send_to(&bytes, addr).await?;
        junta_metrics::record_message(kind, true);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

pub struct UdpSource {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

impl std::fmt::Debug for UdpSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSource").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Source for UdpSource {
    async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.buf).await {
                Ok(r) => r,
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some
                    // platforms; the socket itself is still usable.
                    tracing::debug!("peer socket receive error: {}", e);
                    continue;
                }
            };
            let packet = match Packet::decode(&self.buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    junta_metrics::metrics()
                        .messages_dropped
                        .with_label_values(&["malformed"])
                        .inc();
                    tracing::warn!("undecodable datagram from {}: {}", from, e);
                    continue;
                }
            };
            match convert::envelope_from_proto(packet) {
                Ok(env) => {
                    junta_metrics::record_message(env.msg.kind(), false);
                    return Some(env);
                }
                Err(e) => {
                    junta_metrics::metrics()
                        .messages_dropped
                        .with_label_values(&["malformed"])
                        .inc();
                    tracing::warn!("invalid packet from {}: {}", from, e);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
