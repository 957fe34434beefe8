//! Mutations: the values the consensus engine agrees on.

use crate::codec;
use crate::snapshot::Snapshot;
use crate::StoreError;
use std::fmt;

/// Expected-version guard for a write.
///
/// Comparisons are made against the version of the path, never its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cas {
    /// Succeeds only if the path does not exist.
    Missing,
    /// Always succeeds.
    Clobber,
    /// Succeeds only if the path's current version equals this one.
    Exact(u64),
}

impl Cas {
    /// Check the guard against the current version of a path
    /// (`None` if the path does not exist).
    pub fn check(self, path: &str, current: Option<u64>) -> Result<(), StoreError> {
        let ok = match self {
            Cas::Clobber => true,
            Cas::Missing => current.is_none(),
            Cas::Exact(v) => current == Some(v),
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::CasMismatch {
                path: path.to_string(),
                expected: self,
                found: current.map_or(Cas::Missing, Cas::Exact),
            })
        }
    }
}

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cas::Missing => f.write_str("missing"),
            Cas::Clobber => f.write_str("clobber"),
            Cas::Exact(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Set,
    Delete,
    Nop,
}

/// A single store mutation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub path: String,
    pub body: Vec<u8>,
    pub cas: Cas,
    /// Tag used by the submitting node to match the resulting event.
    pub request_id: Option<String>,
}

impl Mutation {
    pub fn set(path: impl Into<String>, body: impl Into<Vec<u8>>, cas: Cas) -> Self {
        Self {
            kind: MutationKind::Set,
            path: path.into(),
            body: body.into(),
            cas,
            request_id: None,
        }
    }

    pub fn delete(path: impl Into<String>, cas: Cas) -> Self {
        Self {
            kind: MutationKind::Delete,
            path: path.into(),
            body: Vec::new(),
            cas,
            request_id: None,
        }
    }

    pub fn nop() -> Self {
        Self {
            kind: MutationKind::Nop,
            path: String::new(),
            body: Vec::new(),
            cas: Cas::Clobber,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Encode as a proposal value.
    pub fn encode(&self) -> Vec<u8> {
        codec::encode_mutation(self)
    }
}

/// A decoded proposal value: either a mutation or a bootstrap snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Mutate(Mutation),
    Restore(Snapshot),
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Mutate(m) => codec::encode_mutation(m),
            Command::Restore(s) => codec::encode_snapshot(s),
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self, StoreError> {
        codec::decode_command(raw)
    }
}

impl From<Mutation> for Command {
    fn from(m: Mutation) -> Self {
        Command::Mutate(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_missing() {
        assert!(Cas::Missing.check("/p", None).is_ok());
        let err = Cas::Missing.check("/p", Some(3)).unwrap_err();
        assert_eq!(
            err,
            StoreError::CasMismatch {
                path: "/p".into(),
                expected: Cas::Missing,
                found: Cas::Exact(3),
            }
        );
    }

    #[test]
    fn test_cas_exact() {
        assert!(Cas::Exact(7).check("/p", Some(7)).is_ok());
        assert!(Cas::Exact(7).check("/p", Some(8)).is_err());
        assert!(Cas::Exact(7).check("/p", None).is_err());
    }

    #[test]
    fn test_cas_clobber() {
        assert!(Cas::Clobber.check("/p", None).is_ok());
        assert!(Cas::Clobber.check("/p", Some(99)).is_ok());
    }

    #[test]
    fn test_cas_display() {
        assert_eq!(Cas::Exact(12).to_string(), "12");
        assert_eq!(Cas::Missing.to_string(), "missing");
    }
}
