//! The transport capability the engine is written against.
//!
//! A [`Sink`] delivers an [`Envelope`] to a peer at most once per call, with
//! no ordering or delivery guarantee; a [`Source`] yields whatever arrives.
//! [`LocalNetwork`] is an in-process implementation used by tests and
//! simulations.

use crate::msg::Envelope;
use junta_common::{NodeId, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[async_trait::async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Hand `env` to the network for delivery to `to`. `Ok` does not mean
    /// the peer received it.
    async fn send(&self, to: &NodeId, env: Envelope) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
pub trait Source: Send + 'static {
    /// Next inbound envelope, or `None` once the transport is closed.
    async fn recv(&mut self) -> Option<Envelope>;
}

#[async_trait::async_trait]
impl<S: Sink> Sink for Arc<S> {
    async fn send(&self, to: &NodeId, env: Envelope) -> Result<(), TransportError> {
        (**self).send(to, env).await
    }
}

// ---------------------------------------------------------------------------
// In-process network
// ---------------------------------------------------------------------------

type Registry = Arc<RwLock<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>>;

/// A registry of in-process mailboxes keyed by node id.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Registry,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork").finish_non_exhaustive()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return its sending and receiving ends. Joining
    /// again replaces the previous mailbox.
    pub async fn join(&self, id: NodeId) -> (LocalSink, LocalSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.write().await.insert(id, tx);
        (
            LocalSink {
                registry: self.registry.clone(),
            },
            LocalSource { rx },
        )
    }

    /// Remove `id`; its source ends once drained.
    pub async fn leave(&self, id: &NodeId) {
        self.registry.write().await.remove(id);
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        self.registry.read().await.contains_key(id)
    }
}

#[derive(Clone)]
pub struct LocalSink {
    registry: Registry,
}

impl std::fmt::Debug for LocalSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSink").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Sink for LocalSink {
    async fn send(&self, to: &NodeId, env: Envelope) -> Result<(), TransportError> {
        let registry = self.registry.read().await;
        let tx = registry.get(to).ok_or(TransportError::UnknownPeer(*to))?;
        tx.send(env).map_err(|_| TransportError::Dropped(*to))
    }
}

#[derive(Debug)]
pub struct LocalSource {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

#[async_trait::async_trait]
impl Source for LocalSource {
    async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
