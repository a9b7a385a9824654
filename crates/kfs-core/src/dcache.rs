//! Directory lookup cache.
//!
//! A tree of resolved directory names rooted at the root inode, stored as
//! an arena of nodes addressed by [`NodeId`]. Each node keeps its children
//! most-recently-used first; inserting past the per-directory bound drops
//! the least recently used child together with its subtree. Only
//! directories are cached, and a miss is never remembered.

use std::collections::{HashMap, VecDeque};

use kfs_types::InodeNumber;
use serde::Serialize;
use tracing::trace;

/// Handle to a cached directory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node {
    name: Vec<u8>,
    ino: InodeNumber,
    parent: Option<NodeId>,
    children: VecDeque<NodeId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct DirCache {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    by_ino: HashMap<InodeNumber, NodeId>,
    max_children: usize,
    stats: DirCacheStats,
}

impl DirCache {
    #[must_use]
    pub fn new(max_children: usize) -> Self {
        let root = Node {
            name: Vec::new(),
            ino: InodeNumber::ROOT,
            parent: None,
            children: VecDeque::new(),
        };
        let mut by_ino = HashMap::new();
        by_ino.insert(InodeNumber::ROOT, NodeId(0));
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
            by_ino,
            max_children: max_children.max(1),
            stats: DirCacheStats::default(),
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    #[must_use]
    pub fn stats(&self) -> DirCacheStats {
        self.stats
    }

    /// Cached directories, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    #[must_use]
    pub fn ino(&self, id: NodeId) -> Option<InodeNumber> {
        self.node(id).map(|n| n.ino)
    }

    /// Node caching directory `ino`, if any.
    #[must_use]
    pub fn node_of(&self, ino: InodeNumber) -> Option<NodeId> {
        self.by_ino.get(&ino).copied()
    }

    /// Child `name` of `parent`, promoted to the front of its siblings.
    pub fn lookup(&mut self, parent: NodeId, name: &[u8]) -> Option<NodeId> {
        let found = self.node(parent).and_then(|p| {
            p.children
                .iter()
                .position(|&c| self.node(c).is_some_and(|n| n.name == name))
        });
        let Some(pos) = found else {
            self.stats.misses += 1;
            return None;
        };
        self.stats.hits += 1;
        let node = self.node_mut(parent)?;
        let id = node.children.remove(pos)?;
        node.children.push_front(id);
        trace!(name = %String::from_utf8_lossy(name), "dcache hit");
        Some(id)
    }

    /// Cache directory `ino` as child `name` of `parent`.
    ///
    /// Re-inserting an existing name updates it in place. A directory
    /// already cached elsewhere is moved here.
    pub fn insert(&mut self, parent: NodeId, name: &[u8], ino: InodeNumber) -> Option<NodeId> {
        self.node(parent)?;
        if let Some(id) = self.lookup(parent, name) {
            if self.ino(id) == Some(ino) {
                return Some(id);
            }
            self.remove_subtree(id);
        }
        if let Some(existing) = self.node_of(ino) {
            if existing == self.root() {
                return None;
            }
            self.remove_subtree(existing);
        }

        let node = Node {
            name: name.to_vec(),
            ino,
            parent: Some(parent),
            children: VecDeque::new(),
        };
        let id = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                NodeId(idx)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        };
        self.by_ino.insert(ino, id);

        let max = self.max_children;
        let evicted = {
            let p = self.node_mut(parent)?;
            p.children.push_front(id);
            if p.children.len() > max {
                p.children.pop_back()
            } else {
                None
            }
        };
        if let Some(victim) = evicted {
            self.stats.evictions += 1;
            trace!(parent = ?parent, "dcache evict");
            self.drop_subtree(victim);
        }
        trace!(name = %String::from_utf8_lossy(name), ino = ino.0, "dcache insert");
        Some(id)
    }

    /// Forget child `name` of the directory `parent_ino`.
    pub fn remove(&mut self, parent_ino: InodeNumber, name: &[u8]) {
        let Some(parent) = self.node_of(parent_ino) else {
            return;
        };
        let found = self.node(parent).and_then(|p| {
            p.children
                .iter()
                .copied()
                .find(|&c| self.node(c).is_some_and(|n| n.name == name))
        });
        if let Some(id) = found {
            self.remove_subtree(id);
        }
    }

    /// Forget directory `ino` wherever it is cached.
    pub fn forget(&mut self, ino: InodeNumber) {
        if let Some(id) = self.node_of(ino)
            && id != self.root()
        {
            self.remove_subtree(id);
        }
    }

    fn remove_subtree(&mut self, id: NodeId) {
        if let Some(parent) = self.node(id).and_then(|n| n.parent)
            && let Some(p) = self.node_mut(parent)
        {
            p.children.retain(|&c| c != id);
        }
        self.drop_subtree(id);
    }

    /// Release `id` and all its descendants; the parent link is left to the
    /// caller.
    fn drop_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(next.0).and_then(Option::take) {
                stack.extend(node.children);
                if self.by_ino.get(&node.ino) == Some(&next) {
                    self.by_ino.remove(&node.ino);
                }
                self.free.push(next.0);
            }
        }
    }
}
