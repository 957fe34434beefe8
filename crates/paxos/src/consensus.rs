//! The consensus state machine.
//!
//! [`Consensus`] owns one node's acceptor, learner and proposer state and
//! is driven purely by its inputs: incoming envelopes, local proposals and
//! clock ticks. Every call returns [`Effects`] (messages to send and
//! decisions to release) instead of performing I/O, which keeps the
//! protocol deterministic under simulation.
//!
//! Proposing follows the leader fast path: a single Prepare covers every
//! seqn from the first undecided one onwards, after which the leader
//! issues Accepts for new seqns directly under the same ballot. Any
//! quorum timeout abandons the ballot and prepares again with a higher one.

use crate::acceptor::Acceptor;
use crate::ballot::Ballot;
use crate::learner::Learner;
use crate::membership::Membership;
use crate::msg::{Envelope, Msg, Vote};
use junta_common::NodeId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use tokio::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of undecided instances a leader keeps open.
    pub alpha: u64,
    /// How long a Prepare or Accept waits for a quorum before the
    /// proposer retries with a higher ballot.
    pub retry_timeout: Duration,
    /// How long a gap may persist before the learner asks peers for it.
    pub fetch_timeout: Duration,
    /// Leader heartbeat period.
    pub heartbeat: Duration,
    /// Number of released decisions kept to answer `Fetch`.
    pub retain_decided: usize,
    /// Unanswered forwards before a follower challenges the leader.
    pub forward_retries: u32,
    /// Value proposed to fill a seqn nobody else claims.
    pub filler: Vec<u8>,
    /// Seed for retry jitter.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alpha: 50,
            retry_timeout: Duration::from_millis(500),
            fetch_timeout: Duration::from_millis(200),
            heartbeat: Duration::from_millis(250),
            retain_decided: 1024,
            forward_retries: 3,
            filler: Vec::new(),
            seed: 0,
        }
    }
}

impl Config {
    /// A clock period fine enough for every timeout above.
    pub fn tick(&self) -> Duration {
        let finest = self
            .retry_timeout
            .min(self.fetch_timeout)
            .min(self.heartbeat);
        (finest / 4).max(Duration::from_millis(1))
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// A value released for application, in seqn order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub seqn: u64,
    pub value: Vec<u8>,
    /// Time since this node opened the instance, if it proposed it.
    pub latency: Option<Duration>,
}

/// Everything a call into [`Consensus`] asks the caller to do.
#[derive(Debug, Default)]
pub struct Effects {
    pub outbox: Vec<(NodeId, Msg)>,
    pub decided: Vec<Decision>,
    /// Set when this node just won a Prepare round.
    pub elected: Option<Ballot>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty() && self.decided.is_empty() && self.elected.is_none()
    }

    pub fn merge(&mut self, other: Effects) {
        self.outbox.extend(other.outbox);
        self.decided.extend(other.decided);
        if other.elected.is_some() {
            self.elected = other.elected;
        }
    }
}

/// Running counters, read by the node for its metrics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub proposals: u64,
    pub decisions: u64,
    pub prepares: u64,
    pub ballot_retries: u64,
    pub elections: u64,
    pub forwarded: u64,
    pub fetches: u64,
}

// ---------------------------------------------------------------------------
// Per-instance state
// ---------------------------------------------------------------------------

/// Proposer-side progress of one seqn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Preparing,
    Promised,
    Accepting,
    Decided,
}

#[derive(Debug)]
struct Instance {
    ballot: Ballot,
    value: Vec<u8>,
    /// The value was handed to this node to propose (not recovered from a
    /// promise and not a filler), so it must not be lost if another
    /// value wins the seqn.
    own: bool,
    phase: Phase,
    opened: Instant,
    deadline: Instant,
}

#[derive(Debug)]
struct Forward {
    value: Vec<u8>,
    deadline: Instant,
    attempts: u32,
}

#[derive(Debug)]
enum Role {
    Follower,
    Preparing {
        ballot: Ballot,
        from: u64,
        promises: BTreeMap<NodeId, (u64, Vec<Vote>)>,
        deadline: Instant,
    },
    Leading {
        ballot: Ballot,
        promised_by: BTreeSet<NodeId>,
    },
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

pub struct Consensus {
    id: NodeId,
    config: Config,
    acceptor: Acceptor,
    learner: Learner,
    members: Membership,
    peers: BTreeSet<NodeId>,
    leader: Option<NodeId>,
    leader_ballot: Ballot,
    role: Role,
    max_round: u64,
    instances: BTreeMap<u64, Instance>,
    queue: VecDeque<Vec<u8>>,
    forwarded: Vec<Forward>,
    next_seqn: u64,
    gap_since: Option<Instant>,
    last_fetch: Option<Instant>,
    last_heartbeat: Option<Instant>,
    recent: VecDeque<u64>,
    recent_set: HashSet<u64>,
    loopback: VecDeque<Envelope>,
    rng: StdRng,
    stats: Stats,
}

impl std::fmt::Debug for Consensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consensus")
            .field("id", &self.id)
            .field("decided_through", &self.learner.decided_through())
            .field("open", &self.instances.len())
            .field("leader", &self.leader)
            .finish_non_exhaustive()
    }
}

impl Consensus {
    /// Create a node whose seqns `..=start` are already decided.
    pub fn new(
        id: NodeId,
        config: Config,
        acceptor: Acceptor,
        members: Membership,
        start: u64,
    ) -> Self {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&id.as_bytes()[..8]);
        let rng = StdRng::seed_from_u64(config.seed ^ u64::from_le_bytes(prefix));
        let learner = Learner::new(start, config.retain_decided);
        let max_round = acceptor.promised().round;
        let peers = members.union_from(start + 1);

        Self {
            id,
            config,
            acceptor,
            learner,
            members,
            peers,
            leader: None,
            leader_ballot: Ballot::ZERO,
            role: Role::Follower,
            max_round,
            instances: BTreeMap::new(),
            queue: VecDeque::new(),
            forwarded: Vec::new(),
            next_seqn: start + 1,
            gap_since: None,
            last_fetch: None,
            last_heartbeat: None,
            recent: VecDeque::new(),
            recent_set: HashSet::new(),
            loopback: VecDeque::new(),
            rng,
            stats: Stats::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn decided_through(&self) -> u64 {
        self.learner.decided_through()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn is_leading(&self) -> bool {
        matches!(self.role, Role::Leading { .. })
    }

    /// The ballot this node is currently preparing or leading with.
    pub fn ballot(&self) -> Option<Ballot> {
        match &self.role {
            Role::Follower => None,
            Role::Preparing { ballot, .. } | Role::Leading { ballot, .. } => Some(*ballot),
        }
    }

    pub fn phase(&self, seqn: u64) -> Phase {
        if self.learner.is_decided(seqn) {
            return Phase::Decided;
        }
        self.instances
            .get(&seqn)
            .map_or(Phase::Idle, |inst| inst.phase)
    }

    /// Seqns this node has opened and not yet seen decided.
    pub fn open_instances(&self) -> Vec<u64> {
        self.instances
            .keys()
            .copied()
            .filter(|&s| !self.learner.is_decided(s))
            .collect()
    }

    /// Values waiting for a seqn (pipeline full or leadership pending).
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn members(&self) -> &Membership {
        &self.members
    }

    pub fn acceptor(&self) -> &Acceptor {
        &self.acceptor
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// The decided value at `seqn`, while still retained.
    pub fn decided(&self, seqn: u64) -> Option<&[u8]> {
        self.learner.decided(seqn)
    }

    // -----------------------------------------------------------------------
    // Control inputs
    // -----------------------------------------------------------------------

    /// Install the acceptor set for seqns `from..`.
    pub fn set_members(&mut self, from: u64, members: BTreeSet<NodeId>) {
        self.peers.extend(members.iter().copied());
        self.members.set(from, members);
    }

    /// Every node that should learn decisions.
    pub fn set_peers(&mut self, peers: BTreeSet<NodeId>) {
        self.peers = peers;
        self.peers.extend(self.members.union_from(self.decided_through() + 1));
    }

    /// Adopt an externally published leader.
    pub fn set_leader(&mut self, leader: Option<NodeId>) {
        if leader == self.leader {
            return;
        }
        tracing::debug!("leader hint {:?} -> {:?}", self.leader, leader);
        self.leader = leader;
    }

    /// Flush acceptor state to stable storage. Must succeed before the
    /// outbox of the preceding calls is sent.
    pub fn flush(&mut self) -> Result<(), junta_storage::WalError> {
        self.acceptor.flush()
    }

    /// Submit a value for the next free seqn.
    pub fn propose(&mut self, value: Vec<u8>, now: Instant) -> Effects {
        let mut fx = Effects::default();
        self.stats.proposals += 1;
        self.queue.push_back(value);
        self.finish(now, &mut fx);
        fx
    }

    /// Start a Prepare round with a ballot above every ballot seen.
    pub fn challenge(&mut self, now: Instant) -> Effects {
        let mut fx = Effects::default();
        self.start_prepare(now, &mut fx);
        self.finish(now, &mut fx);
        fx
    }

    /// Handle one message from a peer.
    pub fn handle(&mut self, env: Envelope, now: Instant) -> Effects {
        let mut fx = Effects::default();
        self.dispatch(env, now, &mut fx);
        self.finish(now, &mut fx);
        fx
    }

    /// Advance timers.
    pub fn tick(&mut self, now: Instant) -> Effects {
        let mut fx = Effects::default();
        self.on_tick(now, &mut fx);
        self.finish(now, &mut fx);
        fx
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn send(&mut self, to: NodeId, msg: Msg, fx: &mut Effects) {
        if to == self.id {
            self.loopback.push_back(Envelope::new(self.id, msg));
        } else {
            fx.outbox.push((to, msg));
        }
    }

    fn broadcast<I>(&mut self, to: I, msg: &Msg, fx: &mut Effects)
    where
        I: IntoIterator<Item = NodeId>,
    {
        for id in to {
            self.send(id, msg.clone(), fx);
        }
    }

    fn learners(&self, seqn: u64) -> BTreeSet<NodeId> {
        let mut all = self.peers.clone();
        all.extend(self.members.at(seqn).iter().copied());
        all
    }

    fn jitter(&mut self, base: Duration) -> Duration {
        let spread = base.as_millis() as u64;
        base + Duration::from_millis(self.rng.gen_range(0..=spread))
    }

    fn observe(&mut self, ballot: Ballot) {
        self.max_round = self.max_round.max(ballot.round);
    }

    /// Drain local messages, release decisions, then refill the pipeline.
    fn finish(&mut self, now: Instant, fx: &mut Effects) {
        loop {
            while let Some(env) = self.loopback.pop_front() {
                self.dispatch(env, now, fx);
            }
            self.release(now, fx);
            self.fill(now, fx);
            if self.loopback.is_empty() {
                break;
            }
        }
    }

    fn dispatch(&mut self, env: Envelope, now: Instant, fx: &mut Effects) {
        let Envelope { from, msg } = env;
        match msg {
            Msg::Prepare { seqn, ballot } => self.on_prepare(from, seqn, ballot, fx),
            Msg::Promise {
                seqn,
                ballot,
                floor,
                accepted,
            } => self.on_promise(from, seqn, ballot, floor, accepted, now, fx),
            Msg::Reject {
                ballot, promised, ..
            } => self.on_reject(ballot, promised),
            Msg::Accept {
                seqn,
                ballot,
                value,
            } => self.on_accept(from, seqn, ballot, value, fx),
            Msg::Accepted {
                seqn,
                ballot,
                value,
            } => {
                self.observe(ballot);
                self.learner
                    .on_accepted(seqn, ballot, from, value, &self.members);
            }
            Msg::Learn { seqn, value } => {
                self.learner.decide(seqn, value);
            }
            Msg::Propose { value } => self.on_forwarded(from, value, now, fx),
            Msg::Fetch { seqn } => self.on_fetch(from, seqn, fx),
            Msg::Heartbeat {
                ballot,
                decided_through,
            } => self.on_heartbeat(from, ballot, decided_through),
        }
    }

    // -----------------------------------------------------------------------
    // Acceptor side
    // -----------------------------------------------------------------------

    fn on_prepare(&mut self, from: NodeId, seqn: u64, ballot: Ballot, fx: &mut Effects) {
        self.observe(ballot);
        if !self.members.union_from(seqn).contains(&self.id) {
            return;
        }
        let reply = match self.acceptor.on_prepare(seqn, ballot) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("acceptor log write failed, not promising: {}", e);
                return;
            }
        };
        if matches!(reply, Msg::Promise { .. }) {
            self.follow(ballot, "promised a higher ballot");
        }
        self.send(from, reply, fx);
    }

    fn on_accept(&mut self, from: NodeId, seqn: u64, ballot: Ballot, value: Vec<u8>, fx: &mut Effects) {
        self.observe(ballot);
        if !self.members.at(seqn).contains(&self.id) {
            return;
        }
        let reply = match self.acceptor.on_accept(seqn, ballot, value) {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("acceptor log write failed, not accepting: {}", e);
                return;
            }
        };
        match reply {
            Msg::Accepted { .. } => {
                self.follow(ballot, "accepted a higher ballot");
                let mut to = self.learners(seqn);
                to.insert(from);
                self.broadcast(to, &reply, fx);
            }
            reject => self.send(from, reject, fx),
        }
    }

    /// Treat `ballot`'s owner as leader unless we know a newer one, and
    /// give up proposing if it outranks the ballot we hold.
    fn follow(&mut self, ballot: Ballot, why: &str) {
        if ballot < self.leader_ballot || ballot.node == self.id {
            return;
        }
        self.leader_ballot = ballot;
        if let Some(mine) = self.ballot() {
            if ballot <= mine {
                return;
            }
            tracing::info!("stepping down from {} ({}: {})", mine, why, ballot);
            self.role = Role::Follower;
        }
        self.leader = Some(ballot.node);
    }

    // -----------------------------------------------------------------------
    // Learner side
    // -----------------------------------------------------------------------

    fn on_fetch(&mut self, from: NodeId, seqn: u64, fx: &mut Effects) {
        let mut s = seqn;
        while s < seqn + self.config.alpha {
            let Some(value) = self.learner.decided(s) else {
                break;
            };
            let msg = Msg::Learn {
                seqn: s,
                value: value.to_vec(),
            };
            self.send(from, msg, fx);
            s += 1;
        }
    }

    fn on_heartbeat(&mut self, from: NodeId, ballot: Ballot, decided_through: u64) {
        self.observe(ballot);
        self.learner.note_progress(decided_through);
        if from != self.id {
            self.follow(ballot, "heartbeat from a higher ballot");
        }
    }

    fn release(&mut self, now: Instant, fx: &mut Effects) {
        for (seqn, value) in self.learner.release() {
            let mut latency = None;
            if let Some(inst) = self.instances.remove(&seqn) {
                latency = Some(now.saturating_duration_since(inst.opened));
                if inst.own && inst.value != value {
                    tracing::debug!("seqn {} went to another value; requeueing ours", seqn);
                    self.queue.push_front(inst.value);
                }
            }
            self.remember(&value);
            self.forwarded.retain(|f| f.value != value);
            self.queue.retain(|v| *v != value);
            self.stats.decisions += 1;
            fx.decided.push(Decision {
                seqn,
                value,
                latency,
            });
        }
        self.compact();
    }

    fn remember(&mut self, value: &[u8]) {
        let h = digest(value);
        if self.recent_set.insert(h) {
            self.recent.push_back(h);
        }
        while self.recent.len() > self.config.retain_decided {
            if let Some(old) = self.recent.pop_front() {
                self.recent_set.remove(&old);
            }
        }
    }

    fn compact(&mut self) {
        let retain = self.config.retain_decided as u64;
        let through = self.learner.decided_through().saturating_sub(retain);
        if through >= self.acceptor.floor() + retain.max(1) {
            if let Err(e) = self.acceptor.compact(through) {
                tracing::warn!("acceptor compaction failed: {}", e);
            }
            self.members.prune(through + 1);
        }
    }

    // -----------------------------------------------------------------------
    // Proposer side
    // -----------------------------------------------------------------------

    fn on_forwarded(&mut self, from: NodeId, value: Vec<u8>, now: Instant, fx: &mut Effects) {
        if self.recent_set.contains(&digest(&value))
            || self.queue.contains(&value)
            || self.instances.values().any(|i| i.value == value)
        {
            return;
        }
        match self.leader {
            Some(l) if l != self.id && l != from && !self.is_leading() => {
                self.stats.forwarded += 1;
                self.send(l, Msg::Propose { value }, fx);
            }
            // The sender takes us for the leader while we take it for one.
            Some(l) if l == from && matches!(self.role, Role::Follower) => {
                self.queue.push_back(value);
                self.start_prepare(now, fx);
            }
            _ => self.queue.push_back(value),
        }
    }

    fn start_prepare(&mut self, now: Instant, fx: &mut Effects) {
        let ballot = Ballot::new(self.max_round + 1, self.id);
        self.max_round = ballot.round;
        let from = self.learner.decided_through() + 1;
        let deadline = now + self.jitter(self.config.retry_timeout);
        for inst in self.instances.values_mut() {
            if inst.phase != Phase::Decided {
                inst.phase = Phase::Preparing;
            }
        }
        tracing::debug!("preparing {} from seqn {}", ballot, from);
        self.stats.prepares += 1;
        self.role = Role::Preparing {
            ballot,
            from,
            promises: BTreeMap::new(),
            deadline,
        };
        let to = self.members.union_from(from);
        self.broadcast(to, &Msg::Prepare { seqn: from, ballot }, fx);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_promise(
        &mut self,
        from: NodeId,
        seqn: u64,
        ballot: Ballot,
        floor: u64,
        accepted: Vec<Vote>,
        now: Instant,
        fx: &mut Effects,
    ) {
        let Role::Preparing {
            ballot: mine,
            from: start,
            promises,
            ..
        } = &mut self.role
        else {
            return;
        };
        if *mine != ballot || *start != seqn {
            return;
        }
        promises.insert(from, (floor, accepted));
        let voters: BTreeSet<NodeId> = promises.keys().copied().collect();
        if self.members.is_quorum_from(seqn, &voters) {
            self.become_leader(now, fx);
        }
    }

    fn become_leader(&mut self, now: Instant, fx: &mut Effects) {
        let Role::Preparing {
            ballot,
            from,
            promises,
            ..
        } = std::mem::replace(&mut self.role, Role::Follower)
        else {
            return;
        };

        let mut floor = 0;
        let mut best: BTreeMap<u64, (Ballot, Vec<u8>)> = BTreeMap::new();
        for (f, votes) in promises.values() {
            floor = floor.max(*f);
            for vote in votes {
                match best.get(&vote.seqn) {
                    Some((b, _)) if *b >= vote.ballot => {}
                    _ => {
                        best.insert(vote.seqn, (vote.ballot, vote.value.clone()));
                    }
                }
            }
        }
        let promised_by: BTreeSet<NodeId> = promises.keys().copied().collect();

        // Seqns at or below a peer's floor are decided; learn them instead.
        let first = from.max(floor + 1);
        if floor >= from {
            self.learner.note_progress(floor);
        }
        let mut top = self.learner.highest_known();
        if let Some((&s, _)) = best.iter().next_back() {
            top = top.max(s);
        }
        if let Some((&s, _)) = self.instances.iter().next_back() {
            top = top.max(s);
        }

        // Our instances below `first` were decided elsewhere; if our value
        // lost, it is proposed again once the decision arrives.
        let below = self.instances.split_off(&first);
        for (seqn, inst) in std::mem::replace(&mut self.instances, below) {
            if inst.own && !self.learner.is_decided(seqn) {
                self.queue.push_front(inst.value);
            }
        }

        tracing::info!("elected with {} (seqns from {})", ballot, first);
        self.stats.elections += 1;
        self.role = Role::Leading {
            ballot,
            promised_by,
        };
        self.leader = Some(self.id);
        self.leader_ballot = ballot;
        self.last_heartbeat = None;
        fx.elected = Some(ballot);

        for seqn in first..=top {
            if self.learner.is_decided(seqn) {
                continue;
            }
            let existing = self.instances.remove(&seqn);
            let (value, own) = match (best.remove(&seqn), existing) {
                (Some((_, value)), Some(inst)) => {
                    if inst.own && inst.value != value {
                        self.queue.push_front(inst.value);
                    }
                    (value, false)
                }
                (Some((_, value)), None) => (value, false),
                (None, Some(inst)) => (inst.value, inst.own),
                (None, None) => (self.config.filler.clone(), false),
            };
            self.open(seqn, ballot, value, own, Phase::Promised, now, fx);
        }
        self.next_seqn = self.next_seqn.max(top + 1);
    }

    #[allow(clippy::too_many_arguments)]
    fn open(
        &mut self,
        seqn: u64,
        ballot: Ballot,
        value: Vec<u8>,
        own: bool,
        from_phase: Phase,
        now: Instant,
        fx: &mut Effects,
    ) {
        let opened = self
            .instances
            .get(&seqn)
            .map_or(now, |inst| inst.opened);
        let deadline = now + self.jitter(self.config.retry_timeout);
        let msg = Msg::Accept {
            seqn,
            ballot,
            value: value.clone(),
        };
        tracing::trace!("seqn {}: {:?} -> Accepting", seqn, from_phase);
        self.instances.insert(
            seqn,
            Instance {
                ballot,
                value,
                own,
                phase: Phase::Accepting,
                opened,
                deadline,
            },
        );
        let to = self.members.at(seqn).clone();
        self.broadcast(to, &msg, fx);
    }

    fn on_reject(&mut self, ballot: Ballot, promised: Ballot) {
        self.observe(promised);
        if self.ballot() == Some(ballot) {
            self.follow(promised, "rejected");
        }
    }

    /// Open instances for queued values while the window allows.
    fn fill(&mut self, now: Instant, fx: &mut Effects) {
        self.next_seqn = self.next_seqn.max(self.learner.decided_through() + 1);
        let leading = match &self.role {
            Role::Preparing { .. } => return,
            Role::Leading {
                ballot,
                promised_by,
            } => Some((*ballot, promised_by.clone())),
            Role::Follower => None,
        };
        match leading {
            Some((ballot, promised_by)) => {
                while !self.queue.is_empty() {
                    let seqn = self.next_seqn;
                    if seqn > self.learner.decided_through() + self.config.alpha {
                        tracing::trace!("pipeline full at seqn {}", seqn);
                        break;
                    }
                    if !self.members.is_quorum(seqn, &promised_by) {
                        tracing::info!("acceptor set changed at seqn {}; re-preparing", seqn);
                        self.start_prepare(now, fx);
                        return;
                    }
                    let Some(value) = self.queue.pop_front() else {
                        break;
                    };
                    self.next_seqn += 1;
                    self.open(seqn, ballot, value, true, Phase::Idle, now, fx);
                }
            }
            None => {
                if self.queue.is_empty() {
                    return;
                }
                match self.leader {
                    Some(l) if l != self.id => {
                        while let Some(value) = self.queue.pop_front() {
                            let deadline = now + self.jitter(self.config.retry_timeout);
                            self.stats.forwarded += 1;
                            self.send(l, Msg::Propose { value: value.clone() }, fx);
                            self.forwarded.push(Forward {
                                value,
                                deadline,
                                attempts: 1,
                            });
                        }
                    }
                    _ => self.start_prepare(now, fx),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn on_tick(&mut self, now: Instant, fx: &mut Effects) {
        let (prepare_expired, leading) = match &self.role {
            Role::Preparing { deadline, .. } => (*deadline <= now, None),
            Role::Leading { ballot, .. } => (false, Some(*ballot)),
            Role::Follower => (false, None),
        };
        if prepare_expired {
            tracing::debug!("prepare timed out; retrying with a higher ballot");
            self.stats.ballot_retries += 1;
            self.start_prepare(now, fx);
        }
        if let Some(ballot) = leading {
            let stalled = self
                .instances
                .iter()
                .any(|(&s, inst)| inst.deadline <= now && !self.learner.is_decided(s));
            if stalled {
                tracing::debug!("accept timed out under {}; retrying with a higher ballot", ballot);
                self.stats.ballot_retries += 1;
                self.start_prepare(now, fx);
            } else if self
                .last_heartbeat
                .map_or(true, |t| now.saturating_duration_since(t) >= self.config.heartbeat)
            {
                self.last_heartbeat = Some(now);
                let msg = Msg::Heartbeat {
                    ballot,
                    decided_through: self.learner.decided_through(),
                };
                let me = self.id;
                let to = self.learners(self.learner.decided_through() + 1);
                self.broadcast(to.into_iter().filter(move |&p| p != me), &msg, fx);
            }
        }

        if matches!(self.role, Role::Follower) {
            // Instances left over from a lost leadership go to the leader.
            let expired: Vec<u64> = self
                .instances
                .iter()
                .filter(|(&s, inst)| inst.deadline <= now && !self.learner.is_decided(s))
                .map(|(&s, _)| s)
                .collect();
            for seqn in expired {
                if let Some(inst) = self.instances.remove(&seqn) {
                    tracing::debug!("seqn {} under {} expired without a decision", seqn, inst.ballot);
                    if inst.own {
                        self.queue.push_front(inst.value);
                    }
                }
            }
        }

        self.retry_forwards(now, fx);
        self.repair_gaps(now, fx);
    }

    fn retry_forwards(&mut self, now: Instant, fx: &mut Effects) {
        let mut i = 0;
        while i < self.forwarded.len() {
            if self.forwarded[i].deadline > now {
                i += 1;
                continue;
            }
            let leader = self.leader.filter(|&l| l != self.id);
            match leader {
                Some(l) if self.forwarded[i].attempts < self.config.forward_retries => {
                    let deadline = now + self.jitter(self.config.retry_timeout);
                    let f = &mut self.forwarded[i];
                    f.attempts += 1;
                    f.deadline = deadline;
                    let msg = Msg::Propose {
                        value: f.value.clone(),
                    };
                    self.stats.forwarded += 1;
                    self.send(l, msg, fx);
                    i += 1;
                }
                _ => {
                    let f = self.forwarded.remove(i);
                    tracing::info!("leader {:?} unresponsive; proposing locally", self.leader);
                    self.leader = None;
                    self.queue.push_back(f.value);
                }
            }
        }
    }

    fn repair_gaps(&mut self, now: Instant, fx: &mut Effects) {
        if !self.learner.has_gap() {
            self.gap_since = None;
            return;
        }
        let since = *self.gap_since.get_or_insert(now);
        let fetch_due = self
            .last_fetch
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.fetch_timeout);
        if now.saturating_duration_since(since) >= self.config.fetch_timeout && fetch_due {
            self.last_fetch = Some(now);
            self.stats.fetches += 1;
            let seqn = self.learner.decided_through() + 1;
            tracing::debug!("fetching seqn {} (known through {})", seqn, self.learner.highest_known());
            let to: Vec<NodeId> = self
                .learners(seqn)
                .into_iter()
                .filter(|&p| p != self.id)
                .collect();
            self.broadcast(to, &Msg::Fetch { seqn }, fx);
        }
        let escalate_after = self.config.retry_timeout * 2 + self.config.fetch_timeout;
        if now.saturating_duration_since(since) >= escalate_after
            && !matches!(self.role, Role::Preparing { .. })
        {
            tracing::info!(
                "seqn {} still missing; filling by prepare",
                self.learner.decided_through() + 1
            );
            self.gap_since = Some(now);
            self.stats.ballot_retries += 1;
            self.start_prepare(now, fx);
        }
    }
}

fn digest(value: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    value.hash(&mut h);
    h.finish()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 20])
    }

    fn node(me: u8, all: &[u8], alpha: u64) -> Consensus {
        let config = Config {
            alpha,
            ..Config::default()
        };
        let members = Membership::new(all.iter().map(|&b| id(b)));
        Consensus::new(id(me), config, Acceptor::in_memory(), members, 0)
    }

    /// Deliver messages until quiet, in FIFO order, dropping nothing.
    fn run(nodes: &mut [Consensus], mut inflight: Vec<(NodeId, NodeId, Msg)>, now: Instant) -> Vec<Vec<Decision>> {
        let mut decided = vec![Vec::new(); nodes.len()];
        let mut steps = 0;
        while !inflight.is_empty() {
            steps += 1;
            assert!(steps < 100_000, "message storm");
            let (from, to, msg) = inflight.remove(0);
            let Some(idx) = nodes.iter().position(|n| n.id() == to) else {
                continue;
            };
            let fx = nodes[idx].handle(Envelope::new(from, msg), now);
            decided[idx].extend(fx.decided);
            inflight.extend(fx.outbox.into_iter().map(|(t, m)| (to, t, m)));
        }
        decided
    }

    fn outbox(from: NodeId, fx: Effects) -> Vec<(NodeId, NodeId, Msg)> {
        fx.outbox.into_iter().map(|(t, m)| (from, t, m)).collect()
    }

    #[test]
    fn test_single_node_decides_alone() {
        let now = Instant::now();
        let mut n = node(1, &[1], 50);
        let fx = n.propose(b"a".to_vec(), now);
        assert!(fx.outbox.is_empty());
        assert_eq!(fx.elected.map(|b| b.node), Some(id(1)));
        assert_eq!(fx.decided.len(), 1);
        assert_eq!(fx.decided[0].seqn, 1);
        assert_eq!(fx.decided[0].value, b"a");
        assert!(n.is_leading());

        let fx = n.propose(b"b".to_vec(), now);
        assert_eq!(fx.decided[0].seqn, 2);
        assert_eq!(n.stats().prepares, 1, "no second prepare while uncontested");
    }

    #[test]
    fn test_three_nodes_agree() {
        let now = Instant::now();
        let all = [1, 2, 3];
        let mut nodes: Vec<Consensus> = all.iter().map(|&i| node(i, &all, 50)).collect();

        let fx = nodes[0].propose(b"x".to_vec(), now);
        let decided = run(&mut nodes, outbox(id(1), fx), now);
        for d in &decided {
            assert_eq!(d.len(), 1);
            assert_eq!(d[0].value, b"x");
        }
        for n in &nodes {
            assert_eq!(n.phase(1), Phase::Decided);
        }
    }

    #[test]
    fn test_follower_forwards_to_leader() {
        let now = Instant::now();
        let all = [1, 2, 3];
        let mut nodes: Vec<Consensus> = all.iter().map(|&i| node(i, &all, 50)).collect();
        let fx = nodes[0].propose(b"first".to_vec(), now);
        run(&mut nodes, outbox(id(1), fx), now);
        assert_eq!(nodes[1].leader(), Some(id(1)));

        let fx = nodes[1].propose(b"second".to_vec(), now);
        assert!(fx
            .outbox
            .iter()
            .any(|(to, m)| *to == id(1) && matches!(m, Msg::Propose { .. })));
        let decided = run(&mut nodes, outbox(id(2), fx), now);
        assert_eq!(decided[1][0].seqn, 2);
        assert_eq!(decided[1][0].value, b"second");
        assert_eq!(nodes[0].stats().prepares, 1);
    }

    #[test]
    fn test_pipeline_defers_beyond_alpha() {
        let now = Instant::now();
        let all = [1, 2, 3];
        let mut leader = node(1, &all, 50);
        leader.set_leader(Some(id(1)));

        // Win leadership with promises from 2 and 3, but never answer any
        // Accept, so nothing decides.
        let fx = leader.challenge(now);
        let ballot = leader.ballot().unwrap();
        drop(fx);
        for p in [2, 3] {
            leader.handle(
                Envelope::new(
                    id(p),
                    Msg::Promise {
                        seqn: 1,
                        ballot,
                        floor: 0,
                        accepted: vec![],
                    },
                ),
                now,
            );
        }
        assert!(leader.is_leading());

        for i in 0..60u32 {
            leader.propose(i.to_le_bytes().to_vec(), now);
        }
        assert_eq!(leader.open_instances().len(), 50);
        assert_eq!(leader.open_instances().last(), Some(&50));
        assert_eq!(leader.queued(), 10);
        assert_eq!(leader.phase(51), Phase::Idle);

        // Deciding seqn 1 admits exactly one more instance.
        leader.handle(Envelope::new(id(1), Msg::Learn { seqn: 1, value: 0u32.to_le_bytes().to_vec() }), now);
        assert_eq!(leader.phase(51), Phase::Accepting);
        assert_eq!(leader.phase(52), Phase::Idle);
        assert_eq!(leader.queued(), 9);
    }

    #[test]
    fn test_prepare_recovers_accepted_value() {
        let now = Instant::now();
        let all = [1, 2, 3];
        let mut nodes: Vec<Consensus> = all.iter().map(|&i| node(i, &all, 50)).collect();

        // Node 3 accepted "old" at seqn 1 under a stale ballot.
        let stale = Ballot::new(0, id(9));
        nodes[2]
            .handle(
                Envelope::new(
                    id(9),
                    Msg::Accept {
                        seqn: 1,
                        ballot: stale,
                        value: b"old".to_vec(),
                    },
                ),
                now,
            );

        // Node 1 proposes "new"; only node 3 answers its prepare first.
        let fx = nodes[0].propose(b"new".to_vec(), now);
        let ballot = nodes[0].ballot().unwrap();
        assert!(ballot > stale);
        let prepares: Vec<_> = outbox(id(1), fx);
        let decided = run(&mut nodes, prepares.into_iter().rev().collect(), now);

        // Whichever promises formed the quorum, seqn 1 holds one value
        // everywhere and "new" is not lost.
        let at_one: Vec<&Vec<u8>> = decided.iter().filter_map(|d| d.first()).map(|d| &d.value).collect();
        assert!(at_one.windows(2).all(|w| w[0] == w[1]));
        let leader_values: Vec<&[u8]> = decided[0].iter().map(|d| d.value.as_slice()).collect();
        assert!(leader_values.contains(&&b"new"[..]));
    }

    #[test]
    fn test_higher_prepare_makes_leader_step_down() {
        let now = Instant::now();
        let all = [1, 2, 3];
        let mut a = node(1, &all, 50);
        a.challenge(now);
        let mine = a.ballot().unwrap();
        let higher = mine.successor(id(2));
        let fx = a.handle(Envelope::new(id(2), Msg::Prepare { seqn: 1, ballot: higher }), now);
        assert!(matches!(fx.outbox[0].1, Msg::Promise { .. }));
        assert_eq!(a.ballot(), None);
        assert_eq!(a.leader(), Some(id(2)));
    }

    #[test]
    fn test_fetch_answers_with_retained_values() {
        let now = Instant::now();
        let mut n = node(1, &[1], 50);
        n.propose(b"a".to_vec(), now);
        n.propose(b"b".to_vec(), now);
        let fx = n.handle(Envelope::new(id(7), Msg::Fetch { seqn: 1 }), now);
        let learned: Vec<u64> = fx
            .outbox
            .iter()
            .filter_map(|(_, m)| match m {
                Msg::Learn { seqn, .. } => Some(*seqn),
                _ => None,
            })
            .collect();
        assert_eq!(learned, vec![1, 2]);
    }

    #[test]
    fn test_gap_triggers_fetch_then_prepare() {
        let start = Instant::now();
        let all = [1, 2, 3];
        let mut n = node(2, &all, 50);
        n.handle(Envelope::new(id(1), Msg::Learn { seqn: 3, value: b"c".to_vec() }), start);

        let fx = n.tick(start);
        assert!(fx.outbox.is_empty(), "gap too young to fetch");

        let later = start + n.config().fetch_timeout;
        let fx = n.tick(later);
        assert!(fx.outbox.iter().any(|(_, m)| matches!(m, Msg::Fetch { seqn: 1 })));

        let much_later = start + n.config().retry_timeout * 3 + n.config().fetch_timeout;
        let fx = n.tick(much_later);
        assert!(fx.outbox.iter().any(|(_, m)| matches!(m, Msg::Prepare { seqn: 1, .. })));
    }

    #[test]
    fn test_prepare_fills_holes_with_filler() {
        let now = Instant::now();
        let all = [1, 2, 3];
        let mut n = Consensus::new(
            id(1),
            Config {
                filler: b"nop".to_vec(),
                ..Config::default()
            },
            Acceptor::in_memory(),
            Membership::new(all.iter().map(|&b| id(b))),
            0,
        );
        // Seqn 2 is decided but 1 is unknown to everyone.
        n.handle(Envelope::new(id(2), Msg::Learn { seqn: 2, value: b"b".to_vec() }), now);
        n.challenge(now);
        let ballot = n.ballot().unwrap();
        let fx = n.handle(
            Envelope::new(
                id(2),
                Msg::Promise {
                    seqn: 1,
                    ballot,
                    floor: 0,
                    accepted: vec![],
                },
            ),
            now,
        );
        assert!(n.is_leading());
        assert!(fx.outbox.iter().any(|(_, m)| matches!(
            m,
            Msg::Accept { seqn: 1, value, .. } if value == b"nop"
        )));
    }

    #[test]
    fn test_accept_timeout_retries_with_higher_ballot() {
        let now = Instant::now();
        let all = [1, 2, 3];
        let mut n = node(1, &all, 50);
        n.challenge(now);
        let first = n.ballot().unwrap();
        let later = now + n.config().retry_timeout * 3;
        n.tick(later);
        let second = n.ballot().unwrap();
        assert!(second > first);
        assert_eq!(n.stats().ballot_retries, 1);
    }

    #[test]
    fn test_non_member_does_not_vote() {
        let now = Instant::now();
        let mut n = node(4, &[1, 2, 3], 50);
        let fx = n.handle(
            Envelope::new(id(1), Msg::Prepare { seqn: 1, ballot: Ballot::new(1, id(1)) }),
            now,
        );
        assert!(fx.outbox.is_empty());
    }
}
