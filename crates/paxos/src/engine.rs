//! Async driver for [`Consensus`].
//!
//! [`Engine::spawn`] moves the state machine onto its own task, which is
//! the only place it is ever touched. Inputs arrive from the transport
//! [`Source`], from [`Engine`] handles, and from a periodic tick; every
//! step's effects are made durable, then sent through the [`Sink`], then
//! reported on the [`EngineEvent`] channel.

use crate::ballot::Ballot;
use crate::consensus::{Consensus, Decision, Effects, Stats};
use crate::msg::Envelope;
use crate::transport::{Sink, Source};
use crate::EngineError;
use junta_common::NodeId;
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

/// Something the owner of an engine must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The next value in seqn order.
    Decided(Decision),
    /// This node won a Prepare round.
    Elected(Ballot),
}

/// A point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub decided_through: u64,
    pub leader: Option<NodeId>,
    pub leading: bool,
    pub open: usize,
    pub queued: usize,
    pub stats: Stats,
}

enum Command {
    Propose(Vec<u8>),
    SetMembers { from: u64, members: BTreeSet<NodeId> },
    SetPeers(BTreeSet<NodeId>),
    SetLeader(Option<NodeId>),
    Challenge,
    Status(oneshot::Sender<Status>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running engine task.
#[derive(Clone)]
pub struct Engine {
    id: NodeId,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start driving `core` over the given transport. The returned receiver
    /// yields decisions strictly in seqn order.
    pub fn spawn<K, R>(core: Consensus, sink: K, source: R) -> (Self, mpsc::UnboundedReceiver<EngineEvent>)
    where
        K: Sink,
        R: Source,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let id = core.id();
        tokio::spawn(run(core, sink, source, rx, events));
        (Self { id, commands }, events_rx)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn command(&self, cmd: Command) -> Result<(), EngineError> {
        self.commands.send(cmd).map_err(|_| EngineError::Stopped)
    }

    /// Submit a value. Values must be unique; the engine treats a value
    /// equal to one recently decided as already proposed.
    pub fn propose(&self, value: Vec<u8>) -> Result<(), EngineError> {
        self.command(Command::Propose(value))
    }

    /// Install the acceptor set for seqns `from..`.
    pub fn set_members(&self, from: u64, members: BTreeSet<NodeId>) -> Result<(), EngineError> {
        self.command(Command::SetMembers { from, members })
    }

    pub fn set_peers(&self, peers: BTreeSet<NodeId>) -> Result<(), EngineError> {
        self.command(Command::SetPeers(peers))
    }

    pub fn set_leader(&self, leader: Option<NodeId>) -> Result<(), EngineError> {
        self.command(Command::SetLeader(leader))
    }

    /// Contest leadership with a fresh, higher ballot.
    pub fn challenge(&self) -> Result<(), EngineError> {
        self.command(Command::Challenge)
    }

    pub async fn status(&self) -> Result<Status, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Status(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Stop the engine after flushing acceptor state. Other handles fail
    /// with [`EngineError::Stopped`] from then on.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Shutdown(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

async fn run<K: Sink, R: Source>(
    mut core: Consensus,
    sink: K,
    mut source: R,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    let mut ticker = tokio::time::interval(core.config().tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!("consensus engine {} started at seqn {}", core.id(), core.decided_through());

    loop {
        let fx = tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    tracing::info!("all engine handles dropped; stopping");
                    break;
                };
                let now = Instant::now();
                match cmd {
                    Command::Propose(value) => core.propose(value, now),
                    Command::SetMembers { from, members } => {
                        core.set_members(from, members);
                        Effects::default()
                    }
                    Command::SetPeers(peers) => {
                        core.set_peers(peers);
                        Effects::default()
                    }
                    Command::SetLeader(leader) => {
                        core.set_leader(leader);
                        Effects::default()
                    }
                    Command::Challenge => core.challenge(now),
                    Command::Status(reply) => {
                        let _ = reply.send(status(&core));
                        Effects::default()
                    }
                    Command::Shutdown(done) => {
                        commands.close();
                        if let Err(e) = core.flush() {
                            tracing::error!("final acceptor flush failed: {}", e);
                        }
                        tracing::info!("consensus engine {} stopped", core.id());
                        let _ = done.send(());
                        return;
                    }
                }
            }
            env = source.recv() => match env {
                Some(env) => core.handle(env, Instant::now()),
                None => {
                    tracing::info!("transport closed; stopping engine");
                    break;
                }
            },
            _ = ticker.tick() => core.tick(Instant::now()),
        };
        emit(&mut core, &sink, fx, &events).await;
    }

    if let Err(e) = core.flush() {
        tracing::error!("final acceptor flush failed: {}", e);
    }
}

/// Make acceptor state durable, then release the step's effects. If the
/// flush fails, replies that depend on it must not leave the node.
async fn emit<K: Sink>(
    core: &mut Consensus,
    sink: &K,
    fx: Effects,
    events: &mpsc::UnboundedSender<EngineEvent>,
) {
    if fx.is_empty() {
        return;
    }
    let Effects {
        outbox,
        decided,
        elected,
    } = fx;

    match core.flush() {
        Ok(()) => {
            let me = core.id();
            for (to, msg) in outbox {
                let kind = msg.kind();
                if let Err(e) = sink.send(&to, Envelope::new(me, msg)).await {
                    tracing::debug!("{} to {} not sent: {}", kind, to, e);
                }
            }
        }
        Err(e) => {
            tracing::error!("acceptor flush failed; withholding {} messages: {}", outbox.len(), e);
        }
    }

    if let Some(ballot) = elected {
        let _ = events.send(EngineEvent::Elected(ballot));
    }
    for d in decided {
        let _ = events.send(EngineEvent::Decided(d));
    }
}

fn status(core: &Consensus) -> Status {
    Status {
        decided_through: core.decided_through(),
        leader: core.leader(),
        leading: core.is_leading(),
        open: core.open_instances().len(),
        queued: core.queued(),
        stats: core.stats(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
