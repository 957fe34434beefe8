//! The running daemon.
//!
//! A [`Node`] owns one [`Store`] and one consensus [`Engine`] and runs the
//! loop between them: every decided value is applied to the store in
//! seqn order, and every change to the daemon's own records under
//! `/junta` is fed back into the engine (acceptor set, peers, leader).
//!
//! Writes go through [`Node::set`] and [`Node::delete`]. Each one is tagged
//! with a fresh request id so the caller can be handed the event its own
//! mutation produced, even when the proposal was forwarded to the leader.

use crate::{bootstrap, cluster, paths, NodeError};
use junta_common::NodeId;
use junta_config::NodeConfig;
use junta_net::{JoinGrant, JoinHandler, JoinRequest, PeerSet};
use junta_paxos::{
    Acceptor, Ballot, Config, Consensus, Decision, Engine, EngineEvent, Stats, Status,
};
use junta_store::{
    Cas, Change, Event, Fanout, Glob, Mutation, Snapshot, SnapshotEntry, Store, StoreError,
    StoreOptions, Subscription, Waiter, WatchPolicy,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

/// How long a joining node waits for a member to admit it.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// File name of the acceptor log inside the data directory.
pub const ACCEPTOR_LOG: &str = "acceptor.wal";

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Cheaply cloneable handle to a running node.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

struct Shared {
    id: NodeId,
    addr: SocketAddr,
    join_addr: SocketAddr,
    cluster: String,
    alpha: u64,
    nudge: Duration,
    store: Store,
    engine: Engine,
    peers: PeerSet,
    pending: Mutex<HashMap<String, oneshot::Sender<Event>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.shared.id)
            .field("addr", &self.shared.addr)
            .field("seqn", &self.shared.store.seqn())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Node {
    /// Bind the peer socket and join endpoint, found or join a cluster as
    /// configured, and start the engine and background tasks.
    pub async fn start(id: NodeId, config: &NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let alpha = config.paxos.alpha;
        let store = Store::new(StoreOptions {
            history: config.store.history,
            watch: WatchPolicy::from_capacity(config.store.watch_queue),
            claim_once: Some(Glob::new(paths::SLOTS)?),
        });

        let peers = PeerSet::new();
        let (sink, source) = junta_net::bind(id, config.listen, peers.clone()).await?;
        let bound = sink.local_addr()?;
        let listener = TcpListener::bind(bound).await?;
        let join_addr = listener.local_addr()?;
        let addr = config.publish.unwrap_or(bound);
        tracing::info!("node {} peer address {}, join endpoint {}", id, addr, join_addr);

        let log = config.storage.data_dir.join(ACCEPTOR_LOG);
        let start = match config.attach {
            Some(attach) => {
                let request = JoinRequest {
                    id,
                    addr,
                    cluster: config.cluster.clone(),
                };
                join(&store, attach, &request).await?
            }
            None => {
                if config.storage.durable_acceptor && log.exists() {
                    tracing::info!("founding a new cluster; discarding {}", log.display());
                    std::fs::remove_file(&log)?;
                }
                bootstrap::found(&store, id, addr, config.paxos.slots, alpha)?
            }
        };

        let acceptor = if config.storage.durable_acceptor {
            std::fs::create_dir_all(&config.storage.data_dir)?;
            Acceptor::open(&log, config.storage.fsync)?
        } else {
            Acceptor::in_memory()
        };

        let core_config = Config {
            alpha,
            retry_timeout: config.paxos.retry_timeout(),
            fetch_timeout: config.paxos.fetch_timeout(),
            heartbeat: config.paxos.heartbeat(),
            retain_decided: config.paxos.retain_decided,
            filler: Mutation::nop().encode(),
            seed: rand::random(),
            ..Config::default()
        };
        let mut core = Consensus::new(
            id,
            core_config,
            acceptor,
            cluster::membership(&store, alpha),
            start,
        );
        let members = cluster::members(&store);
        core.set_peers(members.keys().copied().collect());
        core.set_leader(cluster::leader(&store));
        peers.replace(members).await;
        let (engine, events) = Engine::spawn(core, sink, source);

        let node = Node {
            shared: Arc::new(Shared {
                id,
                addr,
                join_addr,
                cluster: config.cluster.clone(),
                alpha,
                nudge: config.paxos.retry_timeout() * 2,
                store,
                engine,
                peers,
                pending: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let handler = Arc::new(node.clone());
        let tasks = vec![
            tokio::spawn(node.clone().integrate(events)),
            tokio::spawn(async move {
                if let Err(e) = junta_net::join::serve(listener, handler).await {
                    tracing::error!("join endpoint failed: {}", e);
                }
            }),
            tokio::spawn(node.clone().activate(start + alpha)),
            tokio::spawn(node.clone().publish_stats()),
        ];
        *lock(&node.shared.tasks) = tasks;
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    /// Address other members send consensus traffic to.
    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Where joining nodes connect.
    pub fn join_addr(&self) -> SocketAddr {
        self.shared.join_addr
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    pub async fn status(&self) -> Result<Status, NodeError> {
        Ok(self.shared.engine.status().await?)
    }

    /// Stop the background tasks and the engine. Writes still in flight
    /// fail with [`NodeError::Stopped`].
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        let tasks = std::mem::take(&mut *lock(&self.shared.tasks));
        for task in tasks {
            task.abort();
        }
        lock(&self.shared.pending).clear();
        self.shared.engine.shutdown().await?;
        tracing::info!("node {} stopped", self.shared.id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Propose `Set(path, body, cas)` and wait for it to be applied.
    /// Returns the new version of `path`.
    pub async fn set(
        &self,
        path: &str,
        body: impl Into<Vec<u8>>,
        cas: Cas,
    ) -> Result<u64, NodeError> {
        let event = self.submit("set", Mutation::set(path, body, cas)).await?;
        version_of(event)
    }

    /// Propose `Delete(path, cas)` and wait for it to be applied. Returns
    /// the seqn of the delete.
    pub async fn delete(&self, path: &str, cas: Cas) -> Result<u64, NodeError> {
        let event = self.submit("delete", Mutation::delete(path, cas)).await?;
        version_of(event)
    }

    async fn submit(&self, op: &str, mutation: Mutation) -> Result<Event, NodeError> {
        junta_store::path::segments(&mutation.path)?;
        if paths::is_slot(&mutation.path)
            && cluster::is_claimed(&self.shared.store, &mutation.path)
        {
            return Err(StoreError::Claimed(mutation.path).into());
        }
        let _timer = junta_metrics::start_write_timer(op);
        junta_metrics::metrics().proposals.inc();

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id.clone(), tx);
        let value = mutation.with_request_id(request_id.clone()).encode();
        if let Err(e) = self.shared.engine.propose(value) {
            lock(&self.shared.pending).remove(&request_id);
            return Err(e.into());
        }
        rx.await.map_err(|_| NodeError::Stopped)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, path: &str) -> Result<(Vec<u8>, u64), NodeError> {
        Ok(self.shared.store.get(path)?)
    }

    pub fn getdir(&self, path: &str) -> Result<Vec<String>, NodeError> {
        Ok(self.shared.store.getdir(path)?)
    }

    pub fn walk(&self, pattern: &str) -> Result<Vec<SnapshotEntry>, NodeError> {
        Ok(self.shared.store.walk(pattern)?)
    }

    pub fn watch(&self, pattern: &str) -> Result<Subscription, NodeError> {
        Ok(self.shared.store.watch(pattern)?)
    }

    /// Resolves once `seqn` has been applied locally.
    pub fn wait(&self, seqn: u64) -> Waiter {
        self.shared.store.wait(seqn)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.store.snapshot()
    }

    // -----------------------------------------------------------------------
    // Integration loop
    // -----------------------------------------------------------------------

    async fn integrate(self, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Decided(decision) => self.apply(decision).await,
                EngineEvent::Elected(ballot) => self.record_leadership(ballot),
            }
        }
        tracing::info!("engine event stream closed");
    }

    async fn apply(&self, decision: Decision) {
        let m = junta_metrics::metrics();
        m.decisions.inc();
        if let Some(latency) = decision.latency {
            m.decision_latency_secs.observe(latency.as_secs_f64());
        }

        let outcome = self
            .shared
            .store
            .apply_encoded(decision.seqn, &decision.value);
        let events = outcome.events();
        if events.is_empty() {
            tracing::debug!("seqn {} produced no event: {:?}", decision.seqn, outcome);
        }
        for event in events {
            self.observe(event).await;
        }
    }

    async fn observe(&self, event: &Event) {
        let m = junta_metrics::metrics();
        m.applied.inc();
        m.applied_seqn.set(event.seqn as i64);
        if let Some(err) = event.error() {
            let reason = match err {
                StoreError::CasMismatch { .. } => "cas_mismatch",
                StoreError::NotFound(_) => "not_found",
                StoreError::Malformed(_) => "malformed",
                StoreError::Claimed(_) => "claimed",
            };
            m.rejected_mutations.with_label_values(&[reason]).inc();
            tracing::debug!("seqn {} rejected: {}", event.seqn, err);
        }

        if event.is_change() {
            if let Some(path) = event.path() {
                self.react(event.seqn, path).await;
            }
        }

        if let Some(request_id) = &event.request_id {
            let waiter = lock(&self.shared.pending).remove(request_id);
            if let Some(tx) = waiter {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Feed a change to the daemon's own records back into the engine.
    async fn react(&self, seqn: u64, path: &str) {
        let shared = &self.shared;
        let result = if paths::is_slot(path) {
            let holders = cluster::slot_holders(&shared.store, seqn);
            tracing::info!(
                "{} changed at seqn {}; {} acceptor(s) from seqn {}",
                path,
                seqn,
                holders.len(),
                seqn + shared.alpha
            );
            shared.engine.set_members(seqn + shared.alpha, holders)
        } else if paths::is_member(path) {
            let members = cluster::members(&shared.store);
            let ids = members.keys().copied().collect();
            tracing::info!("membership now {} node(s)", members.len());
            shared.peers.replace(members).await;
            shared.engine.set_peers(ids)
        } else if path == paths::LEADER {
            shared.engine.set_leader(cluster::leader(&shared.store))
        } else {
            Ok(())
        };
        if let Err(e) = result {
            tracing::debug!("engine did not take update for {}: {}", path, e);
        }
    }

    fn record_leadership(&self, ballot: Ballot) {
        let shared = &self.shared;
        if cluster::leader(&shared.store) == Some(shared.id) {
            return;
        }
        tracing::info!("won leadership under {}; recording it", ballot);
        let mutation = Mutation::set(paths::LEADER, shared.id.to_hex(), Cas::Clobber)
            .with_request_id(Uuid::new_v4().to_string());
        if let Err(e) = shared.engine.propose(mutation.encode()) {
            tracing::debug!("leader record not proposed: {}", e);
        }
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    fn holds_slot(&self) -> bool {
        cluster::slot_holders(&self.shared.store, u64::MAX).contains(&self.shared.id)
    }

    /// Once the store has reached `after`, claim an empty slot and so
    /// become an acceptor.
    async fn activate(self, after: u64) {
        if self.holds_slot() {
            return;
        }
        self.reach(after).await;

        let mut slots = match self.shared.store.watch(paths::SLOTS) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("cannot watch slots: {}", e);
                return;
            }
        };
        loop {
            if self.holds_slot() {
                tracing::info!("node {} is an acceptor", self.shared.id);
                return;
            }
            if let Some((path, version)) = cluster::free_slot(&self.shared.store) {
                match self
                    .set(&path, self.shared.id.to_hex(), Cas::Exact(version))
                    .await
                {
                    Ok(seqn) => {
                        tracing::info!("claimed {} at seqn {}", path, seqn);
                        return;
                    }
                    Err(NodeError::Store(
                        StoreError::CasMismatch { .. } | StoreError::Claimed(_),
                    )) => {
                        tracing::debug!("lost the race for {}", path);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("claiming {} failed: {}", path, e);
                        return;
                    }
                }
            }
            if slots.recv().await.is_none() {
                return;
            }
        }
    }

    /// Wait until the store has applied `seqn`, proposing no-ops whenever
    /// the cluster sits idle short of it.
    async fn reach(&self, seqn: u64) {
        let store = &self.shared.store;
        let mut waiter = store.wait(seqn);
        let mut tick = tokio::time::interval(self.shared.nudge);
        tick.tick().await;
        let mut last = store.seqn();
        loop {
            tokio::select! {
                _ = &mut waiter => return,
                _ = tick.tick() => {
                    let now = store.seqn();
                    if now == last && now < seqn {
                        let missing = (seqn - now).min(self.shared.alpha);
                        tracing::debug!("idle at seqn {}; proposing {} no-op(s)", now, missing);
                        for _ in 0..missing {
                            let nop = Mutation::nop().with_request_id(Uuid::new_v4().to_string());
                            if self.shared.engine.propose(nop.encode()).is_err() {
                                return;
                            }
                        }
                    }
                    last = now;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    async fn publish_stats(self) {
        let mut last = Stats::default();
        let mut last_fanout = Fanout::default();
        let mut tick = tokio::time::interval(STATS_INTERVAL);
        loop {
            tick.tick().await;
            let Ok(status) = self.shared.engine.status().await else {
                return;
            };
            let m = junta_metrics::metrics();
            let stats = status.stats;
            m.ballot_retries
                .inc_by(stats.ballot_retries.saturating_sub(last.ballot_retries));
            m.forwarded_proposals
                .inc_by(stats.forwarded.saturating_sub(last.forwarded));
            last = stats;

            let fanout = self.shared.store.fanout();
            m.watch_events_delivered
                .inc_by(fanout.delivered.saturating_sub(last_fanout.delivered) as u64);
            m.watch_subscribers_dropped
                .inc_by(fanout.dropped.saturating_sub(last_fanout.dropped) as u64);
            last_fanout = fanout;
        }
    }
}

fn version_of(event: Event) -> Result<u64, NodeError> {
    match event.change {
        Change::Set { version, .. } | Change::Delete { version, .. } => Ok(version),
        Change::Rejected { error, .. } => Err(error.into()),
        Change::Nop => Ok(event.seqn),
    }
}

async fn join(store: &Store, attach: SocketAddr, request: &JoinRequest) -> Result<u64, NodeError> {
    tracing::info!("joining cluster {:?} via {}", request.cluster, attach);
    let grant = junta_net::join::request(attach, request, JOIN_TIMEOUT).await?;
    let snapshot = Snapshot::decode(&grant.snapshot).map_err(NodeError::Snapshot)?;
    if snapshot.seqn != grant.seqn {
        tracing::warn!(
            "join grant names seqn {} but its snapshot is at {}",
            grant.seqn,
            snapshot.seqn
        );
    }
    let restored = snapshot.entries.len();
    store.restore(snapshot);
    tracing::info!("restored {} path(s) at seqn {}", restored, store.seqn());
    Ok(store.seqn())
}

#[async_trait::async_trait]
impl JoinHandler for Node {
    async fn handle_join(&self, request: JoinRequest) -> Result<JoinGrant, String> {
        if request.cluster != self.shared.cluster {
            return Err(format!(
                "this is cluster {:?}, not {:?}",
                self.shared.cluster, request.cluster
            ));
        }
        let admit = async {
            let addr = request.addr.to_string();
            self.set(&paths::public_addr(&request.id), addr.clone(), Cas::Clobber)
                .await?;
            self.set(&paths::member(&request.id), addr, Cas::Clobber)
                .await?;
            Ok::<_, NodeError>(self.shared.store.snapshot())
        };
        let snapshot = match tokio::time::timeout(JOIN_TIMEOUT, admit).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err("timed out recording the new member".to_string()),
        };
        tracing::info!("admitted {} at seqn {}", request.id, snapshot.seqn);
        Ok(JoinGrant {
            seqn: snapshot.seqn,
            snapshot: snapshot.encode(),
        })
    }
}
