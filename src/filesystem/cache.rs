use std::ops::{Index, IndexMut};
use std::rc::Rc;

use log::{debug, warn};

use crate::structs::{Node, NodeId};
use crate::Error;

use super::Filesystem;

/// Arena owning every in-core node
#[derive(Debug, Default)]
pub struct Cache {
    nodes: Vec<Option<Node>>,
    vacant: Vec<usize>,
    /// Nodes removed from their directory but still referenced
    pub(super) unlinked: Vec<NodeId>,
}

/// Counted reference to a cached node.
/// Cloning takes a reference, dropping releases it.
#[derive(Debug, Clone)]
pub struct NodeRef {
    pub(crate) id: NodeId,
    pin: Rc<()>,
}

impl NodeRef {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.pin, &other.pin)
    }
}

impl Eq for NodeRef {}

impl Index<NodeId> for Cache {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Self::Output {
        match self.nodes.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("stale node {}", id.0),
        }
    }
}

impl IndexMut<NodeId> for Cache {
    fn index_mut(&mut self, id: NodeId) -> &mut Self::Output {
        match self.nodes.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("stale node {}", id.0),
        }
    }
}

impl Cache {
    pub fn insert(&mut self, node: Node) -> NodeId {
        if let Some(slot) = self.vacant.pop() {
            self.nodes[slot] = Some(node);
            NodeId(slot)
        } else {
            self.nodes.push(Some(node));
            NodeId(self.nodes.len() - 1)
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Node {
        let node = self.nodes[id.0].take();
        self.vacant.push(id.0);
        self.unlinked.retain(|&unlinked| unlinked != id);
        match node {
            Some(node) => node,
            None => panic!("double free of node {}", id.0),
        }
    }

    /// Number of nodes held in memory
    pub fn len(&self) -> usize {
        self.nodes.len() - self.vacant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a reference to `id`
    pub fn handle(&self, id: NodeId) -> NodeRef {
        NodeRef {
            id,
            pin: self[id].pin.clone(),
        }
    }

    /// Insert `node` at the head of `dir`'s children
    pub fn attach(&mut self, dir: NodeId, node: NodeId) {
        let head = self[dir].child;
        if let Some(head) = head {
            self[head].prev = Some(node);
        }
        let child = &mut self[node];
        child.parent = Some(dir);
        child.next = head;
        child.prev = None;
        self[dir].child = Some(node);
    }

    /// Insert `node` into `dir`'s children right after `previous`, or as the head
    pub fn append(&mut self, dir: NodeId, node: NodeId, previous: Option<NodeId>) {
        match previous {
            None => self.attach(dir, node),
            Some(previous) => {
                let next = self[previous].next;
                if let Some(next) = next {
                    self[next].prev = Some(node);
                }
                self[previous].next = Some(node);
                let child = &mut self[node];
                child.parent = Some(dir);
                child.prev = Some(previous);
                child.next = next;
            }
        }
    }

    /// Unlink `node` from its siblings and parent
    pub fn detach(&mut self, node: NodeId) {
        let (parent, prev, next) = {
            let node = &self[node];
            (node.parent, node.prev, node.next)
        };
        match prev {
            Some(prev) => self[prev].next = next,
            None => {
                if let Some(parent) = parent {
                    self[parent].child = next;
                }
            }
        }
        if let Some(next) = next {
            self[next].prev = prev;
        }
        let node = &mut self[node];
        node.parent = None;
        node.prev = None;
        node.next = None;
    }

    /// Children of `dir` in list order
    pub fn children(&self, dir: NodeId) -> Vec<NodeId> {
        std::iter::successors(self[dir].child, |&child| self[child].next).collect()
    }
}

impl Filesystem {
    /// Validate `node` against this volume's cache
    pub(crate) fn resolve(&self, node: &NodeRef) -> NodeId {
        let cached = &self.cache[node.id];
        assert!(
            Rc::ptr_eq(&cached.pin, &node.pin),
            "node handle {} does not belong to this volume",
            node.id.0
        );
        node.id
    }

    /// Borrow the node behind a handle
    pub fn node(&self, node: &NodeRef) -> &Node {
        &self.cache[self.resolve(node)]
    }

    pub(crate) fn node_mut(&mut self, node: &NodeRef) -> &mut Node {
        let id = self.resolve(node);
        &mut self.cache[id]
    }

    /// Reference to the root directory
    pub fn root(&self) -> NodeRef {
        self.cache.handle(self.root_id)
    }

    /// Take another reference to `node`
    pub fn get_node(&self, node: &NodeRef) -> NodeRef {
        self.cache.handle(self.resolve(node))
    }

    /// Release a reference. The last reference to an unlinked node frees its clusters.
    pub fn put_node(&mut self, node: NodeRef) -> Result<(), Error> {
        let id = self.resolve(&node);
        drop(node);
        if id == self.root_id {
            return Ok(());
        }
        let released = &self.cache[id];
        if released.references() != 0 {
            return Ok(());
        }
        if released.is_unlinked {
            return self.cleanup_node(id);
        }
        if released.is_dirty {
            warn!("Dirty node '{}' with zero references", released.name());
        }
        Ok(())
    }

    /// Free clusters and memory of an unlinked node nobody references
    pub(crate) fn cleanup_node(&mut self, id: NodeId) -> Result<(), Error> {
        let node = &self.cache[id];
        assert!(
            node.references() == 0,
            "unable to cleanup a node with {} references",
            node.references()
        );
        if !node.is_unlinked {
            return Ok(());
        }
        debug!("Cleaning up unlinked node '{}'", node.name());
        let result = self.resize(id, 0, true);
        // released even if truncation failed
        self.cache.remove(id);
        result
    }

    /// Clean up unlinked nodes whose handles were dropped without [`Self::put_node`]
    pub(crate) fn reap_unlinked(&mut self) -> Result<(), Error> {
        let orphans: Vec<NodeId> = self
            .cache
            .unlinked
            .iter()
            .copied()
            .filter(|&id| self.cache[id].references() == 0)
            .collect();
        let mut result = Ok(());
        for id in orphans {
            if let Err(e) = self.cleanup_node(id) {
                result = Err(e);
            }
        }
        result
    }

    /// Drop every cached node below `id`
    fn reset_subtree(&mut self, id: NodeId) {
        for child in self.cache.children(id) {
            self.reset_subtree(child);
            self.cache.detach(child);
            let node = self.cache.remove(child);
            self.check_released(&node);
        }
        self.cache[id].is_cached = false;
    }

    fn check_released(&self, node: &Node) {
        if node.references() != 0 {
            warn!(
                "Non-zero reference counter ({}) for '{}'",
                node.references(),
                node.name()
            );
        }
        if node.is_dirty {
            warn!("Node '{}' is dirty", node.name());
        }
    }

    /// Forget the whole tree except the root itself
    pub(crate) fn reset_cache(&mut self) {
        self.reset_subtree(self.root_id);
        for id in std::mem::take(&mut self.cache.unlinked) {
            let node = self.cache.remove(id);
            self.check_released(&node);
        }
        let root = &self.cache[self.root_id];
        if root.references() != 0 {
            warn!("Non-zero reference counter ({}) for root", root.references());
        }
    }
}
