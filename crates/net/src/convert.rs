//! Conversions between proto types and domain types.

use junta_common::NodeId;
use junta_paxos::{Ballot, Envelope, Msg, Vote};
use junta_proto::peer as pb;
use junta_proto::peer::packet::Body;

/// Why an inbound packet could not be turned into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    #[error("invalid node id: {0}")]
    NodeId(String),
    #[error("missing field: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// NodeId / Ballot
// ---------------------------------------------------------------------------

pub fn node_id_from_proto(raw: &[u8]) -> Result<NodeId, ConvertError> {
    NodeId::from_slice(raw).map_err(|e| ConvertError::NodeId(e.to_string()))
}

pub fn ballot_to_proto(b: &Ballot) -> pb::Ballot {
    pb::Ballot {
        round: b.round,
        node: b.node.as_bytes().to_vec(),
    }
}

pub fn ballot_from_proto(proto: Option<&pb::Ballot>) -> Result<Ballot, ConvertError> {
    let proto = proto.ok_or(ConvertError::Missing("ballot"))?;
    Ok(Ballot::new(proto.round, node_id_from_proto(&proto.node)?))
}

fn some_ballot(b: &Ballot) -> Option<pb::Ballot> {
    Some(ballot_to_proto(b))
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

pub fn envelope_to_proto(env: Envelope) -> pb::Packet {
    let body = match env.msg {
        Msg::Prepare { seqn, ballot } => Body::Prepare(pb::Prepare {
            seqn,
            ballot: some_ballot(&ballot),
        }),
        Msg::Promise {
            seqn,
            ballot,
            floor,
            accepted,
        } => Body::Promise(pb::Promise {
            seqn,
            ballot: some_ballot(&ballot),
            floor,
            accepted: accepted
                .into_iter()
                .map(|v| pb::Vote {
                    seqn: v.seqn,
                    ballot: some_ballot(&v.ballot),
                    value: v.value,
                })
                .collect(),
        }),
        Msg::Reject {
            seqn,
            ballot,
            promised,
        } => Body::Reject(pb::Reject {
            seqn,
            ballot: some_ballot(&ballot),
            promised: some_ballot(&promised),
        }),
        Msg::Accept {
            seqn,
            ballot,
            value,
        } => Body::Accept(pb::Proposal {
            seqn,
            ballot: some_ballot(&ballot),
            value,
        }),
        Msg::Accepted {
            seqn,
            ballot,
            value,
        } => Body::Accepted(pb::Proposal {
            seqn,
            ballot: some_ballot(&ballot),
            value,
        }),
        Msg::Learn { seqn, value } => Body::Learn(pb::Learn { seqn, value }),
        Msg::Propose { value } => Body::Propose(pb::Forward { value }),
        Msg::Fetch { seqn } => Body::Fetch(pb::Fetch { seqn }),
        Msg::Heartbeat {
            ballot,
            decided_through,
        } => Body::Heartbeat(pb::Heartbeat {
            ballot: some_ballot(&ballot),
            decided_through,
        }),
    };
    pb::Packet {
        from: env.from.as_bytes().to_vec(),
        body: Some(body),
    }
}

pub fn envelope_from_proto(packet: pb::Packet) -> Result<Envelope, ConvertError> {
    let from = node_id_from_proto(&packet.from)?;
    let msg = match packet.body.ok_or(ConvertError::Missing("body"))? {
        Body::Prepare(p) => Msg::Prepare {
            seqn: p.seqn,
            ballot: ballot_from_proto(p.ballot.as_ref())?,
        },
        Body::Promise(p) => Msg::Promise {
            seqn: p.seqn,
            ballot: ballot_from_proto(p.ballot.as_ref())?,
            floor: p.floor,
            accepted: p
                .accepted
                .into_iter()
                .map(|v| {
                    Ok(Vote {
                        seqn: v.seqn,
                        ballot: ballot_from_proto(v.ballot.as_ref())?,
                        value: v.value,
                    })
                })
                .collect::<Result<_, ConvertError>>()?,
        },
        Body::Reject(r) => Msg::Reject {
            seqn: r.seqn,
            ballot: ballot_from_proto(r.ballot.as_ref())?,
            promised: ballot_from_proto(r.promised.as_ref())?,
        },
        Body::Accept(p) => Msg::Accept {
            seqn: p.seqn,
            ballot: ballot_from_proto(p.ballot.as_ref())?,
            value: p.value,
        },
        Body::Accepted(p) => Msg::Accepted {
            seqn: p.seqn,
            ballot: ballot_from_proto(p.ballot.as_ref())?,
            value: p.value,
        },
        Body::Learn(l) => Msg::Learn {
            seqn: l.seqn,
            value: l.value,
        },
        Body::Propose(f) => Msg::Propose { value: f.value },
        Body::Fetch(f) => Msg::Fetch { seqn: f.seqn },
        Body::Heartbeat(h) => Msg::Heartbeat {
            ballot: ballot_from_proto(h.ballot.as_ref())?,
            decided_through: h.decided_through,
        },
    };
    Ok(Envelope::new(from, msg))
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

    #[test]
    fn test_promise_with_votes_converts_back() {
        let env = Envelope::new(
            id(3),
            Msg::Promise {
                seqn: 10,
                ballot: Ballot::new(4, id(1)),
                floor: 6,
                accepted: vec![
                    Vote {
                        seqn: 10,
                        ballot: Ballot::new(2, id(2)),
                        value: b"a".to_vec(),
                    },
                    Vote {
                        seqn: 12,
                        ballot: Ballot::new(3, id(1)),
                        value: Vec::new(),
                    },
                ],
            },
        );
        let back = envelope_from_proto(envelope_to_proto(env.clone())).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_missing_ballot_is_rejected() {
        let packet = pb::Packet {
            from: id(1).as_bytes().to_vec(),
            body: Some(Body::Prepare(pb::Prepare {
                seqn: 1,
                ballot: None,
            })),
        };
        assert_eq!(
            envelope_from_proto(packet),
            Err(ConvertError::Missing("ballot"))
        );
    }

    #[test]
    fn test_short_sender_is_rejected() {
        let packet = pb::Packet {
            from: vec![1, 2, 3],
            body: Some(Body::Fetch(pb::Fetch { seqn: 1 })),
        };
        assert!(matches!(
            envelope_from_proto(packet),
            Err(ConvertError::NodeId(_))
        ));
    }

    #[test]
    fn test_empty_body_is_rejected() {
        let packet = pb::Packet {
            from: id(1).as_bytes().to_vec(),
            body: None,
        };
        assert_eq!(envelope_from_proto(packet), Err(ConvertError::Missing("body")));
    }
}
