//! Wire records for proposal values and snapshots.
//!
//! Hand-written protobuf types using prost derive macros. The same
//! `CommandRecord` envelope carries ordinary mutations and the snapshot
//! a joining node bootstraps from, so both go through one decoder.

use crate::mutation::{Cas, Command, Mutation, MutationKind};
use crate::snapshot::{Snapshot, SnapshotEntry};
use crate::StoreError;
use prost::Message;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct CommandRecord {
    #[prost(oneof = "CommandBody", tags = "1, 2")]
    pub body: Option<CommandBody>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum CommandBody {
    #[prost(message, tag = "1")]
    Mutation(MutationRecord),
    #[prost(message, tag = "2")]
    Snapshot(SnapshotRecord),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum KindRecord {
    Nop = 0,
    Set = 1,
    Delete = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct MutationRecord {
    #[prost(enumeration = "KindRecord", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
    #[prost(oneof = "CasRecord", tags = "4, 5, 6")]
    pub cas: Option<CasRecord>,
    #[prost(string, optional, tag = "7")]
    pub request_id: Option<String>,
}

/// Version guard: an exact version or one of the two reserved sentinels.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum CasRecord {
    #[prost(uint64, tag = "4")]
    Exact(u64),
    #[prost(bool, tag = "5")]
    Missing(bool),
    #[prost(bool, tag = "6")]
    Clobber(bool),
}

#[derive(Clone, PartialEq, Message)]
pub struct SnapshotRecord {
    #[prost(uint64, tag = "1")]
    pub seqn: u64,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<EntryRecord>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntryRecord {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

pub fn encode_mutation(m: &Mutation) -> Vec<u8> {
    CommandRecord {
        body: Some(CommandBody::Mutation(mutation_to_record(m))),
    }
    .encode_to_vec()
}

pub fn encode_snapshot(s: &Snapshot) -> Vec<u8> {
    CommandRecord {
        body: Some(CommandBody::Snapshot(SnapshotRecord {
            seqn: s.seqn,
            entries: s
                .entries
                .iter()
                .map(|e| EntryRecord {
                    path: e.path.clone(),
                    body: e.body.clone(),
                    version: e.version,
                })
                .collect(),
        })),
    }
    .encode_to_vec()
}

fn mutation_to_record(m: &Mutation) -> MutationRecord {
    let kind = match m.kind {
        MutationKind::Nop => KindRecord::Nop,
        MutationKind::Set => KindRecord::Set,
        MutationKind::Delete => KindRecord::Delete,
    };
    let cas = match m.cas {
        Cas::Exact(v) => CasRecord::Exact(v),
        Cas::Missing => CasRecord::Missing(true),
        Cas::Clobber => CasRecord::Clobber(true),
    };
    MutationRecord {
        kind: kind as i32,
        path: m.path.clone(),
        body: m.body.clone(),
        cas: Some(cas),
        request_id: m.request_id.clone(),
    }
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

pub fn decode_command(raw: &[u8]) -> Result<Command, StoreError> {
    let record = CommandRecord::decode(raw)
        .map_err(|e| StoreError::Malformed(format!("undecodable command: {e}")))?;
    match record.body {
        Some(CommandBody::Mutation(m)) => Ok(Command::Mutate(mutation_from_record(m)?)),
        Some(CommandBody::Snapshot(s)) => Ok(Command::Restore(snapshot_from_record(s)?)),
        None => Err(StoreError::Malformed("empty command".into())),
    }
}

/// Decode a value that must be a snapshot (used by the join handshake).
pub fn decode_snapshot(raw: &[u8]) -> Result<Snapshot, StoreError> {
    match decode_command(raw)? {
        Command::Restore(s) => Ok(s),
        Command::Mutate(_) => Err(StoreError::Malformed(
            "expected snapshot, got mutation".into(),
        )),
    }
}

fn mutation_from_record(r: MutationRecord) -> Result<Mutation, StoreError> {
    let kind = match KindRecord::try_from(r.kind) {
        Ok(KindRecord::Nop) => MutationKind::Nop,
        Ok(KindRecord::Set) => MutationKind::Set,
        Ok(KindRecord::Delete) => MutationKind::Delete,
        Err(_) => {
            return Err(StoreError::Malformed(format!(
                "unknown mutation kind {}",
                r.kind
            )))
        }
    };
    let cas = match r.cas {
        Some(CasRecord::Exact(v)) => Cas::Exact(v),
        Some(CasRecord::Missing(_)) => Cas::Missing,
        Some(CasRecord::Clobber(_)) => Cas::Clobber,
        None if kind == MutationKind::Nop => Cas::Clobber,
        None => return Err(StoreError::Malformed("mutation without cas".into())),
    };
    if kind != MutationKind::Nop {
        crate::path::segments(&r.path)?;
    }
    Ok(Mutation {
        kind,
        path: r.path,
        body: r.body,
        cas,
        request_id: r.request_id,
    })
}

fn snapshot_from_record(r: SnapshotRecord) -> Result<Snapshot, StoreError> {
    if r.seqn == u64::MAX {
        return Err(StoreError::Malformed("snapshot seqn out of range".into()));
    }
    let mut entries = Vec::with_capacity(r.entries.len());
    for e in r.entries {
        crate::path::segments(&e.path)?;
        if e.version == 0 || e.version > r.seqn {
            return Err(StoreError::Malformed(format!(
                "snapshot entry {} has version {} outside 1..={}",
                e.path, e.version, r.seqn
            )));
        }
        entries.push(SnapshotEntry {
            path: e.path,
            body: e.body,
            version: e.version,
        });
    }
    Ok(Snapshot {
        seqn: r.seqn,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_roundtrip_all_guards() {
        let cases = [
            Mutation::set("/a/b", b"x".to_vec(), Cas::Missing),
            Mutation::set("/a/b", Vec::new(), Cas::Clobber),
            Mutation::delete("/a", Cas::Exact(42)).with_request_id("req-1"),
            Mutation::nop(),
        ];
        for m in cases {
            let decoded = decode_command(&m.encode()).unwrap();
            assert_eq!(decoded, Command::Mutate(m));
        }
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snap = Snapshot {
            seqn: 9,
            entries: vec![
                SnapshotEntry {
                    path: "/a".into(),
                    body: b"1".to_vec(),
                    version: 3,
                },
                SnapshotEntry {
                    path: "/a/b".into(),
                    body: Vec::new(),
                    version: 9,
                },
            ],
        };
        let decoded = decode_snapshot(&encode_snapshot(&snap)).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = decode_command(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[test]
    fn test_empty_command_is_malformed() {
        let raw = CommandRecord { body: None }.encode_to_vec();
        assert!(matches!(
            decode_command(&raw),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let raw = CommandRecord {
            body: Some(CommandBody::Mutation(MutationRecord {
                kind: 17,
                path: "/a".into(),
                body: Vec::new(),
                cas: Some(CasRecord::Clobber(true)),
                request_id: None,
            })),
        }
        .encode_to_vec();
        assert!(matches!(
            decode_command(&raw),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_path_is_malformed() {
        let m = Mutation::set("no-slash", b"x".to_vec(), Cas::Clobber);
        assert!(matches!(
            decode_command(&m.encode()),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn test_snapshot_version_beyond_seqn_is_malformed() {
        let snap = Snapshot {
            seqn: 2,
            entries: vec![SnapshotEntry {
                path: "/a".into(),
                body: Vec::new(),
                version: 5,
            }],
        };
        assert!(decode_snapshot(&encode_snapshot(&snap)).is_err());
    }

    #[test]
    fn test_snapshot_at_max_seqn_is_malformed() {
        let snap = Snapshot {
            seqn: u64::MAX,
            entries: vec![],
        };
        assert!(matches!(
            decode_snapshot(&encode_snapshot(&snap)),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_snapshot_rejects_mutation() {
        let raw = Mutation::nop().encode();
        assert!(decode_snapshot(&raw).is_err());
    }
}
