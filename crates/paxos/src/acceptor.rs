//! The acceptor role.
//!
//! One promised ballot covers every seqn (a Prepare for `s` is a Prepare
//! for `s..`), while votes are kept per seqn. With a log attached, every
//! state change is appended before the reply that depends on it is
//! returned, so a restarted acceptor keeps refusing ballots it refused
//! before the crash.

use crate::ballot::Ballot;
use crate::msg::{Msg, Vote};
use junta_storage::{FsyncPolicy, Wal, WalError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One durable acceptor state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AcceptorRecord {
    Promise { ballot: Ballot },
    Accept { seqn: u64, ballot: Ballot, value: Vec<u8> },
    Compact { floor: u64 },
}

pub struct Acceptor {
    promised: Ballot,
    accepted: BTreeMap<u64, (Ballot, Vec<u8>)>,
    floor: u64,
    log: Option<Wal<AcceptorRecord>>,
    dirty: bool,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("promised", &self.promised)
            .field("votes", &self.accepted.len())
            .field("floor", &self.floor)
            .field("durable", &self.log.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Acceptor {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Acceptor {
    /// An acceptor whose state dies with the process.
    pub fn in_memory() -> Self {
        Self {
            promised: Ballot::ZERO,
            accepted: BTreeMap::new(),
            floor: 0,
            log: None,
            dirty: false,
        }
    }

    /// Open (or create) a durable acceptor backed by the log at `path`.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let (log, records) = Wal::open(path, fsync)?;
        let mut acceptor = Self::in_memory();
        for record in records {
            acceptor.replay(record);
        }
        tracing::info!(
            "acceptor recovered: promised {}, {} votes, floor {}",
            acceptor.promised,
            acceptor.accepted.len(),
            acceptor.floor
        );
        acceptor.log = Some(log);
        Ok(acceptor)
    }

    fn replay(&mut self, record: AcceptorRecord) {
        match record {
            AcceptorRecord::Promise { ballot } => self.promised = self.promised.max(ballot),
            AcceptorRecord::Accept {
                seqn,
                ballot,
                value,
            } => {
                self.promised = self.promised.max(ballot);
                if seqn > self.floor {
                    self.accepted.insert(seqn, (ballot, value));
                }
            }
            AcceptorRecord::Compact { floor } => {
                self.floor = self.floor.max(floor);
                self.accepted = self.accepted.split_off(&(self.floor + 1));
            }
        }
    }

    fn persist(&mut self, record: &AcceptorRecord) -> Result<(), WalError> {
        if let Some(log) = self.log.as_mut() {
            log.append(record)?;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn promised(&self) -> Ballot {
        self.promised
    }

    /// Seqns at or below the floor are decided and their votes dropped.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn vote(&self, seqn: u64) -> Option<(Ballot, &[u8])> {
        self.accepted.get(&seqn).map(|(b, v)| (*b, v.as_slice()))
    }

    pub fn is_durable(&self) -> bool {
        self.log.is_some()
    }

    /// Phase 1b.
    pub fn on_prepare(&mut self, seqn: u64, ballot: Ballot) -> Result<Msg, WalError> {
        if ballot < self.promised {
            return Ok(Msg::Reject {
                seqn,
                ballot,
                promised: self.promised,
            });
        }
        if ballot > self.promised {
            self.persist(&AcceptorRecord::Promise { ballot })?;
            self.promised = ballot;
        }
        let accepted = self
            .accepted
            .range(seqn..)
            .map(|(&seqn, (ballot, value))| Vote {
                seqn,
                ballot: *ballot,
                value: value.clone(),
            })
            .collect();
        Ok(Msg::Promise {
            seqn,
            ballot,
            floor: self.floor,
            accepted,
        })
    }

    /// Phase 2b. `None` when `seqn` is already compacted away.
    pub fn on_accept(
        &mut self,
        seqn: u64,
        ballot: Ballot,
        value: Vec<u8>,
    ) -> Result<Option<Msg>, WalError> {
        if ballot < self.promised {
            return Ok(Some(Msg::Reject {
                seqn,
                ballot,
                promised: self.promised,
            }));
        }
        if seqn <= self.floor {
            return Ok(None);
        }
        let repeat = matches!(self.accepted.get(&seqn), Some((b, v)) if *b == ballot && *v == value);
        if !repeat {
            self.persist(&AcceptorRecord::Accept {
                seqn,
                ballot,
                value: value.clone(),
            })?;
            self.promised = ballot;
            self.accepted.insert(seqn, (ballot, value.clone()));
        }
        Ok(Some(Msg::Accepted {
            seqn,
            ballot,
            value,
        }))
    }

    /// Drop votes for seqns `..=through`, which must all be decided.
    pub fn compact(&mut self, through: u64) -> Result<(), WalError> {
        if through <= self.floor {
            return Ok(());
        }
        self.floor = through;
        self.accepted = self.accepted.split_off(&(through + 1));

        if let Some(log) = self.log.as_mut() {
            let mut records = Vec::with_capacity(self.accepted.len() + 2);
            records.push(AcceptorRecord::Promise {
                ballot: self.promised,
            });
            records.push(AcceptorRecord::Compact { floor: self.floor });
            records.extend(self.accepted.iter().map(|(&seqn, (ballot, value))| {
                AcceptorRecord::Accept {
                    seqn,
                    ballot: *ballot,
                    value: value.clone(),
                }
            }));
            log.rewrite(&records)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Make every appended record durable. Called before replies leave.
    pub fn flush(&mut self) -> Result<(), WalError> {
        if self.dirty {
            if let Some(log) = self.log.as_mut() {
                log.sync()?;
            }
            self.dirty = false;
        }
        Ok(())
    }
}
