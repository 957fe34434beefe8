//! Watch subscriptions and per-subscriber fan-out.
//!
//! Every subscriber owns its own queue. Publishing never waits on a
//! subscriber: with [`WatchPolicy::Unbounded`] the queue simply grows;
//! with [`WatchPolicy::Bounded`] a subscriber whose queue is full is
//! disconnected and flagged as lagged. Events already queued stay
//! readable after the disconnect.

use crate::event::Event;
use crate::glob::Glob;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Backpressure policy for watch subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchPolicy {
    #[default]
    Unbounded,
    /// Queue at most this many events; overflow disconnects the subscriber.
    Bounded(usize),
}

impl WatchPolicy {
    /// `0` means unbounded, as in the config file.
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            Self::Unbounded
        } else {
            Self::Bounded(capacity)
        }
    }
}

enum Tx {
    Unbounded(mpsc::UnboundedSender<Event>),
    Bounded(mpsc::Sender<Event>),
}

enum Rx {
    Unbounded(mpsc::UnboundedReceiver<Event>),
    Bounded(mpsc::Receiver<Event>),
}

/// The receiving end of a watch.
pub struct Subscription {
    glob: Glob,
    rx: Rx,
    lagged: Arc<AtomicBool>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("glob", &self.glob)
            .field("lagged", &self.is_lagged())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Next matching event, in application order. `None` once the store
    /// is gone or this subscriber was disconnected and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        match &mut self.rx {
            Rx::Unbounded(rx) => rx.recv().await,
            Rx::Bounded(rx) => rx.recv().await,
        }
    }

    /// Non-blocking receive. `None` if nothing is queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        let res = match &mut self.rx {
            Rx::Unbounded(rx) => rx.try_recv(),
            Rx::Bounded(rx) => rx.try_recv(),
        };
        match res {
            Ok(ev) => Some(ev),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Whether this subscriber was disconnected for falling behind.
    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }

    pub fn pattern(&self) -> &Glob {
        &self.glob
    }
}

struct Watcher {
    glob: Glob,
    tx: Tx,
    lagged: Arc<AtomicBool>,
}

/// Outcome counts of one publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fanout {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
pub(crate) struct Watchers {
    list: Vec<Watcher>,
}

impl Watchers {
    pub(crate) fn subscribe(&mut self, glob: Glob, policy: WatchPolicy) -> Subscription {
        let lagged = Arc::new(AtomicBool::new(false));
        let (tx, rx) = match policy {
            WatchPolicy::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Tx::Unbounded(tx), Rx::Unbounded(rx))
            }
            WatchPolicy::Bounded(cap) => {
                let (tx, rx) = mpsc::channel(cap.max(1));
                (Tx::Bounded(tx), Rx::Bounded(rx))
            }
        };
        self.list.push(Watcher {
            glob: glob.clone(),
            tx,
            lagged: lagged.clone(),
        });
        Subscription { glob, rx, lagged }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    /// Hand `event` to every matching subscriber without blocking.
    pub(crate) fn publish(&mut self, event: &Event) -> Fanout {
        let mut fanout = Fanout::default();
        let Some(path) = event.path() else {
            return fanout;
        };
        if !event.is_change() {
            return fanout;
        }
        self.list.retain(|w| {
            if w.glob.matches(path) {
                let sent = match &w.tx {
                    Tx::Unbounded(tx) => tx.send(event.clone()).is_ok(),
                    Tx::Bounded(tx) => match tx.try_send(event.clone()) {
                        Ok(()) => true,
                        Err(TrySendError::Full(_)) => {
                            w.lagged.store(true, Ordering::Release);
                            tracing::warn!(
                                "watcher on {} fell behind at seqn {}; disconnecting",
                                w.glob,
                                event.seqn
                            );
                            false
                        }
                        Err(TrySendError::Closed(_)) => false,
                    },
                };
                if sent {
                    fanout.delivered += 1;
                } else {
                    fanout.dropped += 1;
                }
                sent
            } else {
                match &w.tx {
                    Tx::Unbounded(tx) => !tx.is_closed(),
                    Tx::Bounded(tx) => !tx.is_closed(),
                }
            }
        });
        fanout
    }
}
