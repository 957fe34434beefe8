//! Where the daemon keeps its own records in the store.
//!
//! Node ids appear in paths as 40 lowercase hex digits.

use junta_common::NodeId;

/// Root of everything the daemon itself writes.
pub const ROOT: &str = "/junta";

/// Holds the id of the node that last won a Prepare round.
pub const LEADER: &str = "/junta/leader";

pub const MEMBERS_DIR: &str = "/junta/members";
pub const MEMBERS: &str = "/junta/members/*";

pub const SLOTS_DIR: &str = "/junta/slot";
pub const SLOTS: &str = "/junta/slot/*";

/// `/junta/members/<id>`: the peer address of a member.
pub fn member(id: &NodeId) -> String {
    format!("{}/{}", MEMBERS_DIR, id.to_hex())
}

/// `/junta/slot/<n>`: empty, or the id of the acceptor holding it.
pub fn slot(n: usize) -> String {
    format!("{}/{}", SLOTS_DIR, n)
}

/// `/junta/info/<id>/public-addr`.
pub fn public_addr(id: &NodeId) -> String {
    format!("{}/info/{}/public-addr", ROOT, id.to_hex())
}

pub fn is_slot(path: &str) -> bool {
    path.strip_prefix(SLOTS_DIR)
        .is_some_and(|rest| rest.starts_with('/'))
}

pub fn is_member(path: &str) -> bool {
    path.strip_prefix(MEMBERS_DIR)
        .is_some_and(|rest| rest.starts_with('/'))
}
