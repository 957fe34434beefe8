//! Chaos injection for testing the engine under an unreliable network.
//!
//! [`ChaosSink`] wraps any [`Sink`] and injects configurable faults: random
//! loss, duplication, latency with jitter (which also reorders), and
//! directed partitions.

use crate::msg::Envelope;
use crate::transport::Sink;
use junta_common::{NodeId, TransportError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of silently losing a message \[0.0, 1.0\].
    pub drop_rate: f64,
    /// Probability of delivering a message twice \[0.0, 1.0\].
    pub duplicate_rate: f64,
    /// Fixed latency added to every delivery.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\], drawn per delivery.
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// A sink wrapper that injects loss, duplication, delay and partitions.
///
/// Delayed deliveries run on their own tasks, so `send` never waits out
/// the injected latency and messages overtake each other.
pub struct ChaosSink<S: Sink> {
    inner: Arc<S>,
    config: Arc<RwLock<ChaosConfig>>,
    /// Set of (from, to) pairs that are partitioned.
    partitions: Arc<RwLock<HashSet<(NodeId, NodeId)>>>,
    rng: Arc<Mutex<StdRng>>,
    local_id: NodeId,
}

impl<S: Sink> Clone for ChaosSink<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            partitions: self.partitions.clone(),
            rng: self.rng.clone(),
            local_id: self.local_id,
        }
    }
}

impl<S: Sink> std::fmt::Debug for ChaosSink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosSink")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl<S: Sink> ChaosSink<S> {
    pub fn new(inner: S, local_id: NodeId, config: ChaosConfig) -> Self {
        Self::with_rng(inner, local_id, config, StdRng::from_entropy())
    }

    /// Like [`ChaosSink::new`] but with reproducible fault decisions.
    pub fn seeded(inner: S, local_id: NodeId, config: ChaosConfig, seed: u64) -> Self {
        Self::with_rng(inner, local_id, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inner: S, local_id: NodeId, config: ChaosConfig, rng: StdRng) -> Self {
        Self {
            inner: Arc::new(inner),
            config: Arc::new(RwLock::new(config)),
            partitions: Arc::new(RwLock::new(HashSet::new())),
            rng: Arc::new(Mutex::new(rng)),
            local_id,
        }
    }

    pub async fn set_drop_rate(&self, rate: f64) {
        self.config.write().await.drop_rate = rate;
    }

    pub async fn set_duplicate_rate(&self, rate: f64) {
        self.config.write().await.duplicate_rate = rate;
    }

    pub async fn set_latency(&self, latency: Duration, jitter: Duration) {
        let mut config = self.config.write().await;
        config.latency = latency;
        config.jitter = jitter;
    }

    /// Block all messages from `from` to `to`.
    pub async fn add_partition(&self, from: NodeId, to: NodeId) {
        self.partitions.write().await.insert((from, to));
    }

    /// Cut this node off from `peer` in both directions. Only this sink's
    /// outbound half is enforced here; the peer's own sink handles the rest.
    pub async fn isolate_from(&self, peer: NodeId) {
        let mut partitions = self.partitions.write().await;
        partitions.insert((self.local_id, peer));
        partitions.insert((peer, self.local_id));
    }

    pub async fn remove_partition(&self, from: NodeId, to: NodeId) {
        self.partitions.write().await.remove(&(from, to));
    }

    /// Remove all partitions.
    pub async fn heal_all(&self) {
        self.partitions.write().await.clear();
    }

    /// Decide the fate of one message: how many copies, and each one's delay.
    fn roll(&self, config: &ChaosConfig) -> Vec<Duration> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if config.drop_rate > 0.0 && rng.gen_bool(config.drop_rate.min(1.0)) {
            return Vec::new();
        }
        let copies = if config.duplicate_rate > 0.0 && rng.gen_bool(config.duplicate_rate.min(1.0)) {
            2
        } else {
            1
        };
        (0..copies)
            .map(|_| {
                let jitter_ms = if config.jitter.is_zero() {
                    0
                } else {
                    rng.gen_range(0..=config.jitter.as_millis() as u64)
                };
                config.latency + Duration::from_millis(jitter_ms)
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl<S: Sink> Sink for ChaosSink<S> {
    async fn send(&self, to: &NodeId, env: Envelope) -> Result<(), TransportError> {
        {
            let partitions = self.partitions.read().await;
            if partitions.contains(&(self.local_id, *to)) {
                return Err(TransportError::Dropped(*to));
            }
        }

        let delays = {
            let config = self.config.read().await;
            self.roll(&config)
        };
        if delays.is_empty() {
            tracing::trace!("chaos: dropped {} to {}", env.msg.kind(), to);
            return Ok(());
        }

        for delay in delays {
            if delay.is_zero() {
                let _ = self.inner.send(to, env.clone()).await;
                continue;
            }
            let inner = self.inner.clone();
            let to = *to;
            let env = env.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = inner.send(&to, env).await;
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Msg;
    use crate::transport::{LocalNetwork, LocalSource, Source};

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 20])
    }

    fn fetch(seqn: u64) -> Envelope {
        Envelope::new(id(1), Msg::Fetch { seqn })
    }

    async fn pair(config: ChaosConfig) -> (ChaosSink<crate::transport::LocalSink>, LocalSource) {
        let net = LocalNetwork::new();
        let (sink, _) = net.join(id(1)).await;
        let (_, dst) = net.join(id(2)).await;
        (ChaosSink::seeded(sink, id(1), config, 7), dst)
    }

    #[tokio::test]
    async fn test_chaos_passthrough() {
        let (chaos, mut dst) = pair(ChaosConfig::default()).await;
        chaos.send(&id(2), fetch(1)).await.unwrap();
        assert_eq!(dst.recv().await, Some(fetch(1)));
    }

    #[tokio::test]
    async fn test_chaos_drop_all() {
        let config = ChaosConfig {
            drop_rate: 1.0,
            ..Default::default()
        };
        let (chaos, mut dst) = pair(config).await;
        for seqn in 0..10 {
            chaos.send(&id(2), fetch(seqn)).await.unwrap();
        }
        chaos.set_drop_rate(0.0).await;
        chaos.send(&id(2), fetch(99)).await.unwrap();
        assert_eq!(dst.recv().await, Some(fetch(99)));
    }

    #[tokio::test]
    async fn test_chaos_duplicate_all() {
        let config = ChaosConfig {
            duplicate_rate: 1.0,
            ..Default::default()
        };
        let (chaos, mut dst) = pair(config).await;
        chaos.send(&id(2), fetch(5)).await.unwrap();
        assert_eq!(dst.recv().await, Some(fetch(5)));
        assert_eq!(dst.recv().await, Some(fetch(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chaos_latency_does_not_block_sender() {
        let (chaos, mut dst) = pair(ChaosConfig::default()).await;
        chaos
            .set_latency(Duration::from_millis(100), Duration::ZERO)
            .await;

        let start = tokio::time::Instant::now();
        chaos.send(&id(2), fetch(1)).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));

        assert_eq!(dst.recv().await, Some(fetch(1)));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_chaos_partition_and_heal() {
        let (chaos, mut dst) = pair(ChaosConfig::default()).await;

        chaos.isolate_from(id(2)).await;
        assert!(chaos.send(&id(2), fetch(1)).await.is_err());

        chaos.heal_all().await;
        chaos.send(&id(2), fetch(2)).await.unwrap();
        assert_eq!(dst.recv().await, Some(fetch(2)));
    }

    #[tokio::test]
    async fn test_chaos_partition_is_directed() {
        let (chaos, _dst) = pair(ChaosConfig::default()).await;
        chaos.add_partition(id(2), id(1)).await;
        assert!(chaos.send(&id(2), fetch(1)).await.is_ok());

        chaos.add_partition(id(1), id(2)).await;
        assert!(chaos.send(&id(2), fetch(1)).await.is_err());
        chaos.remove_partition(id(1), id(2)).await;
        assert!(chaos.send(&id(2), fetch(1)).await.is_ok());
    }
}
