//! The in-memory node tree.

use crate::path;
use std::collections::BTreeMap;

/// A tree node. `body == None` marks a pure directory, created
/// implicitly as the parent of a stored path.
#[derive(Debug, Default, Clone)]
pub(crate) struct TreeNode {
    body: Option<Vec<u8>>,
    version: u64,
    children: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    pub(crate) fn lookup(&self, segs: &[&str]) -> Option<&TreeNode> {
        match segs.split_first() {
            None => Some(self),
            Some((head, tail)) => self.children.get(*head)?.lookup(tail),
        }
    }

    /// Body and version of a stored path.
    pub(crate) fn get(&self, segs: &[&str]) -> Option<(&[u8], u64)> {
        let node = self.lookup(segs)?;
        node.body.as_deref().map(|b| (b, node.version))
    }

    /// Current version of a stored path; `None` if it has no body.
    pub(crate) fn version(&self, segs: &[&str]) -> Option<u64> {
        self.get(segs).map(|(_, v)| v)
    }

    pub(crate) fn child_names(&self) -> impl Iterator<Item = &String> {
        self.children.keys()
    }

    pub(crate) fn set(&mut self, segs: &[&str], body: Vec<u8>, version: u64) {
        let mut node = self;
        for seg in segs {
            node = node.children.entry((*seg).to_string()).or_default();
        }
        node.body = Some(body);
        node.version = version;
    }

    /// Remove the body at `segs` and prune directories left empty.
    /// Returns whether anything was removed.
    pub(crate) fn remove(&mut self, segs: &[&str]) -> bool {
        match segs.split_first() {
            None => self.body.take().is_some(),
            Some((head, tail)) => {
                let Some(child) = self.children.get_mut(*head) else {
                    return false;
                };
                let removed = child.remove(tail);
                if child.body.is_none() && child.children.is_empty() {
                    self.children.remove(*head);
                }
                removed
            }
        }
    }

    /// Visit every stored path in path order.
    pub(crate) fn walk<F>(&self, at: &str, visit: &mut F)
    where
        F: FnMut(&str, &[u8], u64),
    {
        if let Some(body) = &self.body {
            visit(at, body, self.version);
        }
        for (name, child) in &self.children {
            child.walk(&path::join(at, name), visit);
        }
    }
}
