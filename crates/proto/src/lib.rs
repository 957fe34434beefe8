//! Protobuf wire records for junta.
//!
//! Hand-written with prost derive macros, so building needs no `protoc`.
//! Field tags are part of the wire format and must never be reused.

/// Consensus traffic, one [`peer::Packet`] per UDP datagram.
pub mod peer {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Ballot {
        #[prost(uint64, tag = "1")]
        pub round: u64,
        #[prost(bytes = "vec", tag = "2")]
        pub node: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Vote {
        #[prost(uint64, tag = "1")]
        pub seqn: u64,
        #[prost(message, optional, tag = "2")]
        pub ballot: Option<Ballot>,
        #[prost(bytes = "vec", tag = "3")]
        pub value: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Prepare {
        #[prost(uint64, tag = "1")]
        pub seqn: u64,
        #[prost(message, optional, tag = "2")]
        pub ballot: Option<Ballot>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Promise {
        #[prost(uint64, tag = "1")]
        pub seqn: u64,
        #[prost(message, optional, tag = "2")]
        pub ballot: Option<Ballot>,
        #[prost(uint64, tag = "3")]
        pub floor: u64,
        #[prost(message, repeated, tag = "4")]
        pub accepted: Vec<Vote>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Reject {
        #[prost(uint64, tag = "1")]
        pub seqn: u64,
        #[prost(message, optional, tag = "2")]
        pub ballot: Option<Ballot>,
        #[prost(message, optional, tag = "3")]
        pub promised: Option<Ballot>,
    }

    /// Shared by Accept and Accepted.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Proposal {
        #[prost(uint64, tag = "1")]
        pub seqn: u64,
        #[prost(message, optional, tag = "2")]
        pub ballot: Option<Ballot>,
        #[prost(bytes = "vec", tag = "3")]
        pub value: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Learn {
        #[prost(uint64, tag = "1")]
        pub seqn: u64,
        #[prost(bytes = "vec", tag = "2")]
        pub value: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Forward {
        #[prost(bytes = "vec", tag = "1")]
        pub value: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Fetch {
        #[prost(uint64, tag = "1")]
        pub seqn: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Heartbeat {
        #[prost(message, optional, tag = "1")]
        pub ballot: Option<Ballot>,
        #[prost(uint64, tag = "2")]
        pub decided_through: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Packet {
        #[prost(bytes = "vec", tag = "1")]
        pub from: Vec<u8>,
        #[prost(oneof = "packet::Body", tags = "2, 3, 4, 5, 6, 7, 8, 9, 10")]
        pub body: Option<packet::Body>,
    }

    pub mod packet {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Body {
            #[prost(message, tag = "2")]
            Prepare(super::Prepare),
            #[prost(message, tag = "3")]
            Promise(super::Promise),
            #[prost(message, tag = "4")]
            Reject(super::Reject),
            #[prost(message, tag = "5")]
            Accept(super::Proposal),
            #[prost(message, tag = "6")]
            Accepted(super::Proposal),
            #[prost(message, tag = "7")]
            Learn(super::Learn),
            #[prost(message, tag = "8")]
            Propose(super::Forward),
            #[prost(message, tag = "9")]
            Fetch(super::Fetch),
            #[prost(message, tag = "10")]
            Heartbeat(super::Heartbeat),
        }
    }
}

/// The join handshake, carried as length-delimited frames over TCP.
pub mod join {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct JoinRequest {
        #[prost(bytes = "vec", tag = "1")]
        pub id: Vec<u8>,
        /// Peer (UDP) address the joiner listens on.
        #[prost(string, tag = "2")]
        pub addr: String,
        #[prost(string, tag = "3")]
        pub cluster: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct JoinResponse {
        /// Seqn the snapshot was taken at.
        #[prost(uint64, tag = "1")]
        pub seqn: u64,
        /// Encoded store snapshot.
        #[prost(bytes = "vec", tag = "2")]
        pub snapshot: Vec<u8>,
        /// Non-empty when the join was refused.
        #[prost(string, tag = "3")]
        pub error: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_packet_roundtrip() {
        let packet = peer::Packet {
            from: vec![7; 20],
            body: Some(peer::packet::Body::Promise(peer::Promise {
                seqn: 4,
                ballot: Some(peer::Ballot {
                    round: 2,
                    node: vec![1; 20],
                }),
                floor: 1,
                accepted: vec![peer::Vote {
                    seqn: 5,
                    ballot: None,
                    value: b"v".to_vec(),
                }],
            })),
        };
        let decoded = peer::Packet::decode(packet.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_empty_join_response_is_not_an_error() {
        let resp = join::JoinResponse::decode(&[][..]).unwrap();
        assert!(resp.error.is_empty());
        assert_eq!(resp.seqn, 0);
    }
}
