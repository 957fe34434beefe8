//! The replicated store: applies decided mutations strictly in seqn order.
//!
//! All mutation goes through one lock together with a seqn-order check,
//! so no two mutations ever interleave even when `apply` is called from
//! several tasks. Out-of-order applies are buffered until the gap before
//! them closes; re-applying an already-applied seqn is a no-op that
//! returns the original event while it is still in the history window.

use crate::event::{Change, Event};
use crate::glob::Glob;
use crate::mutation::{Command, Mutation, MutationKind};
use crate::path;
use crate::snapshot::{Snapshot, SnapshotEntry};
use crate::tree::TreeNode;
use crate::watch::{Fanout, Subscription, WatchPolicy, Watchers};
use crate::StoreError;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Tuning knobs for a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Number of recent events retained for duplicate replay and `wait`.
    pub history: usize,
    /// Backpressure policy applied to every new watch.
    pub watch: WatchPolicy,
    /// Paths that can be written only while they are missing or empty.
    /// Once such a path holds a body it is never set or deleted again, so
    /// its version stays the seqn it was claimed at.
    pub claim_once: Option<Glob>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            history: 1024,
            watch: WatchPolicy::Unbounded,
            claim_once: None,
        }
    }
}

/// What a call to [`Store::apply`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The seqn was applied now. `released` holds any buffered seqns that
    /// became applicable as a result, in order.
    Applied { event: Event, released: Vec<Event> },
    /// The seqn is ahead of the next expected one and was buffered.
    Buffered,
    /// The seqn was already applied; the original event if still retained.
    Duplicate(Option<Event>),
    /// A snapshot replaced the tree; the store is now at `seqn`.
    Restored { seqn: u64, released: Vec<Event> },
}

impl ApplyOutcome {
    /// Every event produced by this call, in seqn order.
    pub fn events(&self) -> Vec<&Event> {
        match self {
            ApplyOutcome::Applied { event, released } => {
                std::iter::once(event).chain(released.iter()).collect()
            }
            ApplyOutcome::Restored { released, .. } => released.iter().collect(),
            ApplyOutcome::Buffered | ApplyOutcome::Duplicate(_) => Vec::new(),
        }
    }
}

/// Resolves once the store has applied a given seqn.
///
/// Yields the event for that seqn, or `None` when the seqn was covered
/// by a snapshot, has left the history window, or the store was dropped.
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<Option<Event>>,
}

impl Future for Waiter {
    type Output = Option<Event>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.ok().flatten())
    }
}

struct Inner {
    root: TreeNode,
    applied: u64,
    pending: BTreeMap<u64, Result<Command, StoreError>>,
    history: VecDeque<Event>,
    waiters: BTreeMap<u64, Vec<oneshot::Sender<Option<Event>>>>,
    watchers: Watchers,
    fanout: Fanout,
    claim_once: Option<Glob>,
}

/// Cheaply cloneable handle to one replicated store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
    options: StoreOptions,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("seqn", &self.seqn())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreOptions::default())
    }
}

impl Store {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                root: TreeNode::default(),
                applied: 0,
                pending: BTreeMap::new(),
                history: VecDeque::new(),
                waiters: BTreeMap::new(),
                watchers: Watchers::default(),
                fanout: Fanout::default(),
                claim_once: options.claim_once.clone(),
            })),
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Apply the command decided for `seqn`.
    ///
    /// A [`Command::Restore`] is only honoured at seqn 1, where joining
    /// nodes bootstrap with `apply(1, snapshot)`. At any later seqn it
    /// consumes the seqn as a rejection carrying `Malformed`.
    pub fn apply(&self, seqn: u64, command: impl Into<Command>) -> ApplyOutcome {
        let history = self.options.history;
        self.lock().apply(seqn, Ok(command.into()), history)
    }

    /// Apply a raw proposal value. An undecodable value still consumes
    /// its seqn, as a rejected no-op carrying `Malformed`.
    pub fn apply_encoded(&self, seqn: u64, raw: &[u8]) -> ApplyOutcome {
        let decoded = Command::decode(raw);
        if let Err(e) = &decoded {
            tracing::warn!("seqn {}: {}", seqn, e);
        }
        let history = self.options.history;
        self.lock().apply(seqn, decoded, history)
    }

    /// Replace the tree with `snapshot`. Equivalent to `apply(1, snapshot)`.
    pub fn restore(&self, snapshot: Snapshot) -> ApplyOutcome {
        self.apply(1, Command::Restore(snapshot))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Highest seqn applied so far (0 for an empty store).
    pub fn seqn(&self) -> u64 {
        self.lock().applied
    }

    /// Body and version of `path`.
    pub fn get(&self, path: &str) -> Result<(Vec<u8>, u64), StoreError> {
        let segs = path::segments(path)?;
        let inner = self.lock();
        inner
            .root
            .get(&segs)
            .map(|(body, version)| (body.to_vec(), version))
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    /// Current version of `path`, `None` if it does not exist.
    pub fn version(&self, path: &str) -> Result<Option<u64>, StoreError> {
        let segs = path::segments(path)?;
        Ok(self.lock().root.version(&segs))
    }

    /// Names of the children of `path`, in order.
    pub fn getdir(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let segs = path::segments(path)?;
        let inner = self.lock();
        let node = inner
            .root
            .lookup(&segs)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok(node.child_names().cloned().collect())
    }

    /// Every stored path matching `pattern`, in path order.
    pub fn walk(&self, pattern: &str) -> Result<Vec<SnapshotEntry>, StoreError> {
        let glob = Glob::new(pattern)?;
        let inner = self.lock();
        let mut out = Vec::new();
        inner.root.walk("/", &mut |p, body, version| {
            if glob.matches(p) {
                out.push(SnapshotEntry {
                    path: p.to_string(),
                    body: body.to_vec(),
                    version,
                });
            }
        });
        Ok(out)
    }

    /// Serialize the whole tree as of the current seqn.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        let mut entries = Vec::new();
        inner.root.walk("/", &mut |p, body, version| {
            entries.push(SnapshotEntry {
                path: p.to_string(),
                body: body.to_vec(),
                version,
            });
        });
        Snapshot {
            seqn: inner.applied,
            entries,
        }
    }

    // -----------------------------------------------------------------------
    // Watch / wait
    // -----------------------------------------------------------------------

    /// Subscribe to future changes whose path matches `pattern`.
    pub fn watch(&self, pattern: &str) -> Result<Subscription, StoreError> {
        let glob = Glob::new(pattern)?;
        let policy = self.options.watch;
        Ok(self.lock().watchers.subscribe(glob, policy))
    }

    /// Number of live watch subscriptions.
    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    /// Cumulative watch deliveries and disconnects since creation.
    pub fn fanout(&self) -> Fanout {
        self.lock().fanout
    }

    /// Register interest in `seqn` being applied. Registration happens
    /// now, so a waiter taken before a restore still observes it.
    pub fn wait(&self, seqn: u64) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if seqn <= inner.applied {
            let _ = tx.send(inner.history_event(seqn));
        } else {
            inner.waiters.entry(seqn).or_default().push(tx);
        }
        Waiter { rx }
    }
}

impl Inner {
    fn apply(
        &mut self,
        seqn: u64,
        command: Result<Command, StoreError>,
        history: usize,
    ) -> ApplyOutcome {
        let command = match command {
            Ok(Command::Restore(snapshot)) if seqn == 1 => return self.restore(snapshot, history),
            Ok(Command::Restore(_)) => Err(misplaced_snapshot(seqn)),
            other => other,
        };
        if seqn <= self.applied {
            return ApplyOutcome::Duplicate(self.history_event(seqn));
        }
        if seqn > self.applied + 1 {
            tracing::debug!("buffering seqn {} (applied through {})", seqn, self.applied);
            self.pending.entry(seqn).or_insert(command);
            return ApplyOutcome::Buffered;
        }
        let event = self.step(seqn, command, history);
        let released = self.drain_pending(history);
        ApplyOutcome::Applied { event, released }
    }

    fn drain_pending(&mut self, history: usize) -> Vec<Event> {
        let mut released = Vec::new();
        while let Some(command) = self.pending.remove(&(self.applied + 1)) {
            let seqn = self.applied + 1;
            released.push(self.step(seqn, command, history));
        }
        released
    }

    /// Apply exactly `seqn == applied + 1`.
    fn step(&mut self, seqn: u64, command: Result<Command, StoreError>, history: usize) -> Event {
        debug_assert_eq!(seqn, self.applied + 1);
        let (change, request_id) = match command {
            Ok(Command::Mutate(m)) => {
                let request_id = m.request_id.clone();
                (self.mutate(seqn, m), request_id)
            }
            Ok(Command::Restore(_)) => (
                Change::Rejected {
                    path: String::new(),
                    error: misplaced_snapshot(seqn),
                },
                None,
            ),
            Err(error) => (
                Change::Rejected {
                    path: String::new(),
                    error,
                },
                None,
            ),
        };
        if let Change::Rejected { path, error } = &change {
            tracing::debug!("seqn {} rejected on {:?}: {}", seqn, path, error);
        }

        let event = Event {
            seqn,
            change,
            request_id,
        };
        self.applied = seqn;

        self.history.push_back(event.clone());
        while self.history.len() > history {
            self.history.pop_front();
        }

        let fanout = self.watchers.publish(&event);
        self.fanout.delivered += fanout.delivered;
        self.fanout.dropped += fanout.dropped;

        let ready = self.waiters.split_off(&(seqn + 1));
        let due = std::mem::replace(&mut self.waiters, ready);
        for (_, txs) in due {
            for tx in txs {
                let _ = tx.send(Some(event.clone()));
            }
        }
        event
    }

    fn mutate(&mut self, seqn: u64, m: Mutation) -> Change {
        let path_str = m.path;
        let segs = match path::segments(&path_str) {
            Ok(segs) if !segs.is_empty() || m.kind == MutationKind::Nop => segs,
            Ok(_) => {
                return Change::Rejected {
                    error: StoreError::Malformed("cannot write the root".into()),
                    path: path_str,
                }
            }
            Err(error) if m.kind != MutationKind::Nop => {
                return Change::Rejected {
                    path: path_str,
                    error,
                }
            }
            Err(_) => Vec::new(),
        };
        let current = self.root.version(&segs);
        let claimed = m.kind != MutationKind::Nop
            && self.claim_once.as_ref().is_some_and(|g| g.matches(&path_str))
            && self.root.get(&segs).is_some_and(|(body, _)| !body.is_empty());

        match m.kind {
            MutationKind::Nop => Change::Nop,
            MutationKind::Set => {
                if let Err(error) = m.cas.check(&path_str, current) {
                    return Change::Rejected {
                        path: path_str,
                        error,
                    };
                }
                if claimed {
                    return Change::Rejected {
                        error: StoreError::Claimed(path_str.clone()),
                        path: path_str,
                    };
                }
                self.root.set(&segs, m.body.clone(), seqn);
                Change::Set {
                    path: path_str,
                    body: m.body,
                    version: seqn,
                }
            }
            MutationKind::Delete => {
                if current.is_none() {
                    return Change::Rejected {
                        error: StoreError::NotFound(path_str.clone()),
                        path: path_str,
                    };
                }
                if let Err(error) = m.cas.check(&path_str, current) {
                    return Change::Rejected {
                        path: path_str,
                        error,
                    };
                }
                if claimed {
                    return Change::Rejected {
                        error: StoreError::Claimed(path_str.clone()),
                        path: path_str,
                    };
                }
                self.root.remove(&segs);
                Change::Delete {
                    path: path_str,
                    version: seqn,
                }
            }
        }
    }

    fn restore(&mut self, snapshot: Snapshot, history: usize) -> ApplyOutcome {
        if snapshot.seqn <= self.applied {
            tracing::debug!(
                "ignoring snapshot at {} (already at {})",
                snapshot.seqn,
                self.applied
            );
            return ApplyOutcome::Duplicate(None);
        }

        let mut root = TreeNode::default();
        for entry in &snapshot.entries {
            match path::segments(&entry.path) {
                Ok(segs) if !segs.is_empty() => root.set(&segs, entry.body.clone(), entry.version),
                _ => tracing::warn!("skipping invalid snapshot path {:?}", entry.path),
            }
        }
        self.root = root;
        self.applied = snapshot.seqn;
        self.history.clear();

        let next = snapshot.seqn.saturating_add(1);
        self.pending = self.pending.split_off(&next);
        let ready = self.waiters.split_off(&next);
        let covered = std::mem::replace(&mut self.waiters, ready);
        for tx in covered.into_values().flatten() {
            let _ = tx.send(None);
        }

        tracing::info!(
            "restored snapshot at seqn {} ({} entries)",
            snapshot.seqn,
            snapshot.entries.len()
        );
        let released = self.drain_pending(history);
        ApplyOutcome::Restored {
            seqn: snapshot.seqn,
            released,
        }
    }

    fn history_event(&self, seqn: u64) -> Option<Event> {
        let first = self.history.front()?.seqn;
        let idx = usize::try_from(seqn.checked_sub(first)?).ok()?;
        self.history.get(idx).cloned()
    }
}

fn misplaced_snapshot(seqn: u64) -> StoreError {
    StoreError::Malformed(format!("snapshot decided at seqn {}", seqn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Cas;

    fn set(path: &str, body: &str, cas: Cas) -> Mutation {
        Mutation::set(path, body.as_bytes().to_vec(), cas)
    }

    fn applied(outcome: ApplyOutcome) -> Event {
        match outcome {
            ApplyOutcome::Applied { event, .. } => event,
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[test]
    fn test_set_then_get() {
        let st = Store::default();
        let ev = applied(st.apply(1, set("/a/b", "x", Cas::Missing)));
        assert_eq!(
            ev.change,
            Change::Set {
                path: "/a/b".into(),
                body: b"x".to_vec(),
                version: 1
            }
        );
        assert_eq!(st.get("/a/b").unwrap(), (b"x".to_vec(), 1));
        assert_eq!(st.seqn(), 1);
    }

    #[test]
    fn test_cas_sequence() {
        let st = Store::default();
        let ev = applied(st.apply(1, set("/p", "v1", Cas::Missing)));
        assert!(ev.is_change());

        let ev = applied(st.apply(2, set("/p", "v2", Cas::Missing)));
        assert!(matches!(
            ev.error(),
            Some(StoreError::CasMismatch { .. })
        ));
        assert_eq!(st.get("/p").unwrap().0, b"v1");

        let ev = applied(st.apply(3, set("/p", "v3", Cas::Clobber)));
        let Change::Set { version: v3, .. } = ev.change else {
            panic!("clobber must succeed");
        };

        let ev = applied(st.apply(4, set("/p", "v4", Cas::Exact(v3))));
        let Change::Set { version: v4, .. } = ev.change else {
            panic!("exact version must succeed");
        };
        assert!(v4 > v3);

        let ev = applied(st.apply(5, set("/p", "v5", Cas::Exact(v3))));
        assert!(ev.error().is_some(), "stale version must be rejected");
        assert_eq!(st.get("/p").unwrap(), (b"v4".to_vec(), 4));
    }

    #[test]
    fn test_cas_ignores_body() {
        let st = Store::default();
        st.apply(1, set("/p", "same", Cas::Missing));
        st.apply(2, set("/p", "same", Cas::Clobber));
        let ev = applied(st.apply(3, set("/p", "same", Cas::Exact(1))));
        assert!(ev.error().is_some(), "version 1 is stale even with same body");
    }

    #[test]
    fn test_delete() {
        let st = Store::default();
        st.apply(1, set("/a", "x", Cas::Missing));

        let ev = applied(st.apply(2, Mutation::delete("/a", Cas::Exact(7))));
        assert!(matches!(ev.error(), Some(StoreError::CasMismatch { .. })));

        let ev = applied(st.apply(3, Mutation::delete("/a", Cas::Exact(1))));
        assert_eq!(
            ev.change,
            Change::Delete {
                path: "/a".into(),
                version: 3
            }
        );
        assert_eq!(st.get("/a"), Err(StoreError::NotFound("/a".into())));

        let ev = applied(st.apply(4, Mutation::delete("/a", Cas::Clobber)));
        assert_eq!(ev.error(), Some(&StoreError::NotFound("/a".into())));
    }

    #[test]
    fn test_claim_once_paths() {
        let st = Store::new(StoreOptions {
            claim_once: Some(Glob::new("/slot/*").unwrap()),
            ..StoreOptions::default()
        });
        applied(st.apply(1, set("/slot/1", "", Cas::Missing)));
        applied(st.apply(2, set("/slot/1", "", Cas::Clobber)));
        let ev = applied(st.apply(3, set("/slot/1", "a", Cas::Exact(2))));
        assert!(ev.is_change());

        let ev = applied(st.apply(4, set("/slot/1", "b", Cas::Clobber)));
        assert_eq!(ev.error(), Some(&StoreError::Claimed("/slot/1".into())));
        let ev = applied(st.apply(5, Mutation::delete("/slot/1", Cas::Exact(3))));
        assert_eq!(ev.error(), Some(&StoreError::Claimed("/slot/1".into())));
        let ev = applied(st.apply(6, set("/slot/1", "c", Cas::Exact(9))));
        assert!(matches!(ev.error(), Some(StoreError::CasMismatch { .. })));
        assert_eq!(st.get("/slot/1").unwrap(), (b"a".to_vec(), 3));

        let ev = applied(st.apply(7, set("/other", "x", Cas::Missing)));
        applied(st.apply(8, set("/other", "y", Cas::Clobber)));
        assert!(ev.is_change());
    }

    #[test]
    fn test_get_missing() {
        let st = Store::default();
        assert!(matches!(st.get("/nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(st.get("bad"), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn test_out_of_order_is_buffered() {
        let st = Store::default();
        assert_eq!(st.apply(3, set("/c", "3", Cas::Missing)), ApplyOutcome::Buffered);
        assert_eq!(st.apply(2, set("/b", "2", Cas::Missing)), ApplyOutcome::Buffered);
        assert_eq!(st.seqn(), 0);
        assert!(st.get("/b").is_err());

        match st.apply(1, set("/a", "1", Cas::Missing)) {
            ApplyOutcome::Applied { event, released } => {
                assert_eq!(event.seqn, 1);
                let seqns: Vec<u64> = released.iter().map(|e| e.seqn).collect();
                assert_eq!(seqns, vec![2, 3]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(st.seqn(), 3);
        assert_eq!(st.get("/c").unwrap().1, 3);
    }

    #[test]
    fn test_duplicate_apply_returns_original_event() {
        let st = Store::default();
        let first = applied(st.apply(1, set("/a", "x", Cas::Missing)));
        let again = st.apply(1, set("/a", "y", Cas::Clobber));
        assert_eq!(again, ApplyOutcome::Duplicate(Some(first)));
        assert_eq!(st.get("/a").unwrap().0, b"x");
    }

    #[test]
    fn test_duplicate_outside_history_window() {
        let st = Store::new(StoreOptions {
            history: 2,
            ..StoreOptions::default()
        });
        for i in 1..=5 {
            st.apply(i, Mutation::nop());
        }
        assert_eq!(st.apply(1, Mutation::nop()), ApplyOutcome::Duplicate(None));
        assert!(matches!(
            st.apply(5, Mutation::nop()),
            ApplyOutcome::Duplicate(Some(_))
        ));
    }

    #[test]
    fn test_malformed_value_consumes_seqn() {
        let st = Store::default();
        let ev = match st.apply_encoded(1, b"\xff\xff\xff") {
            ApplyOutcome::Applied { event, .. } => event,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(ev.error(), Some(StoreError::Malformed(_))));
        assert_eq!(st.seqn(), 1);
    }

    #[test]
    fn test_root_write_rejected() {
        let st = Store::default();
        let ev = applied(st.apply(1, set("/", "x", Cas::Clobber)));
        assert!(matches!(ev.error(), Some(StoreError::Malformed(_))));
    }

    #[test]
    fn test_getdir_and_walk() {
        let st = Store::default();
        st.apply(1, set("/junta/slot/1", "n1", Cas::Missing));
        st.apply(2, set("/junta/slot/2", "", Cas::Missing));
        st.apply(3, set("/junta/leader", "n1", Cas::Missing));

        assert_eq!(st.getdir("/junta").unwrap(), vec!["leader", "slot"]);
        assert_eq!(st.getdir("/junta/slot").unwrap(), vec!["1", "2"]);
        assert!(st.getdir("/nope").is_err());

        let slots = st.walk("/junta/slot/*").unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].path, "/junta/slot/1");
        assert_eq!(st.walk("/**").unwrap().len(), 3);
    }

    #[test]
    fn test_snapshot_restore() {
        let a = Store::default();
        a.apply(1, set("/x", "1", Cas::Missing));
        a.apply(2, set("/y/z", "2", Cas::Missing));
        a.apply(3, Mutation::delete("/x", Cas::Clobber));
        let snap = a.snapshot();
        assert_eq!(snap.seqn, 3);
        assert_eq!(snap.entries.len(), 1);

        let b = Store::default();
        let outcome = b.apply_encoded(1, &snap.encode());
        assert_eq!(
            outcome,
            ApplyOutcome::Restored {
                seqn: 3,
                released: vec![]
            }
        );
        assert_eq!(b.seqn(), 3);
        assert_eq!(b.get("/y/z").unwrap(), (b"2".to_vec(), 2));
        assert_eq!(b.snapshot(), snap);
    }

    #[test]
    fn test_restore_releases_buffered_and_drops_covered() {
        let st = Store::default();
        st.apply(2, set("/covered", "x", Cas::Missing));
        st.apply(5, set("/after", "y", Cas::Missing));

        let snap = Snapshot {
            seqn: 4,
            entries: vec![SnapshotEntry {
                path: "/base".into(),
                body: b"b".to_vec(),
                version: 4,
            }],
        };
        match st.restore(snap) {
            ApplyOutcome::Restored { seqn, released } => {
                assert_eq!(seqn, 4);
                assert_eq!(released.len(), 1);
                assert_eq!(released[0].seqn, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(st.get("/covered").is_err());
        assert_eq!(st.get("/after").unwrap().1, 5);
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let st = Store::default();
        st.apply(1, Mutation::nop());
        st.apply(2, Mutation::nop());
        let outcome = st.restore(Snapshot {
            seqn: 1,
            entries: vec![],
        });
        assert_eq!(outcome, ApplyOutcome::Duplicate(None));
        assert_eq!(st.seqn(), 2);
    }

    #[test]
    fn test_snapshot_after_first_seqn_is_rejected() {
        let st = Store::default();
        st.apply(1, Mutation::nop());
        st.apply(2, set("/a", "x", Cas::Missing));

        let stale = Snapshot {
            seqn: 1,
            entries: vec![],
        };
        let ev = applied(st.apply_encoded(3, &stale.encode()));
        assert_eq!(ev.seqn, 3);
        assert!(matches!(ev.error(), Some(StoreError::Malformed(_))));
        assert_eq!(st.seqn(), 3);
        assert_eq!(st.get("/a").unwrap(), (b"x".to_vec(), 2));

        let ahead = Snapshot {
            seqn: 1000,
            entries: vec![],
        };
        let ev = applied(st.apply(4, Command::Restore(ahead)));
        assert!(ev.error().is_some());
        assert_eq!(st.seqn(), 4);
        assert_eq!(applied(st.apply(5, Mutation::nop())).seqn, 5);
    }

    #[test]
    fn test_buffered_snapshot_is_rejected_when_reached() {
        let st = Store::default();
        let snap = Snapshot {
            seqn: 50,
            entries: vec![],
        };
        assert_eq!(st.apply_encoded(3, &snap.encode()), ApplyOutcome::Buffered);
        st.apply(2, Mutation::nop());
        match st.apply(1, Mutation::nop()) {
            ApplyOutcome::Applied { released, .. } => {
                assert_eq!(released.len(), 2);
                assert!(matches!(
                    released[1].error(),
                    Some(StoreError::Malformed(_))
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(st.seqn(), 3);
    }

    #[tokio::test]
    async fn test_wait_resolves_on_apply() {
        let st = Store::default();
        let waiter = st.wait(2);
        st.apply(1, Mutation::nop());
        st.apply(2, set("/a", "x", Cas::Missing));
        let ev = waiter.await.expect("event for seqn 2");
        assert_eq!(ev.seqn, 2);
        assert_eq!(ev.path(), Some("/a"));
    }

    #[tokio::test]
    async fn test_wait_on_applied_seqn_is_immediate() {
        let st = Store::default();
        st.apply(1, Mutation::nop());
        let ev = st.wait(1).await.unwrap();
        assert_eq!(ev.change, Change::Nop);
    }

    #[tokio::test]
    async fn test_wait_registered_before_restore() {
        let st = Store::default();
        let covered = st.wait(3);
        let after = st.wait(11);
        st.restore(Snapshot {
            seqn: 10,
            entries: vec![],
        });
        assert_eq!(covered.await, None);
        st.apply(11, Mutation::nop());
        assert_eq!(after.await.unwrap().seqn, 11);
    }

    #[tokio::test]
    async fn test_watch_filters_by_glob() {
        let st = Store::default();
        let mut sub = st.watch("/a/*").unwrap();
        st.apply(1, set("/a/b", "x", Cas::Missing));
        st.apply(2, set("/c/d", "y", Cas::Missing));
        st.apply(3, set("/a/b/c", "z", Cas::Missing));

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.seqn, 1);
        assert_eq!(ev.path(), Some("/a/b"));
        assert!(sub.try_recv().is_none(), "exactly one event expected");
    }

    #[tokio::test]
    async fn test_watch_skips_rejected_and_nop() {
        let st = Store::default();
        let mut sub = st.watch("/**").unwrap();
        st.apply(1, set("/a", "x", Cas::Missing));
        st.apply(2, set("/a", "x", Cas::Missing));
        st.apply(3, Mutation::nop());
        st.apply(4, Mutation::delete("/a", Cas::Clobber));

        assert_eq!(sub.recv().await.unwrap().seqn, 1);
        assert_eq!(sub.recv().await.unwrap().seqn, 4);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let st = Store::default();
        let sub = st.watch("/**").unwrap();
        assert_eq!(st.watcher_count(), 1);
        drop(sub);
        st.apply(1, set("/a", "x", Cas::Missing));
        assert_eq!(st.watcher_count(), 0);
    }

    #[test]
    fn test_bad_glob_rejected() {
        let st = Store::default();
        assert!(matches!(st.watch("a/*"), Err(StoreError::Malformed(_))));
    }
}
