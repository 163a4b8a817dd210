pub mod aabb;
pub mod key;
pub mod node;
pub mod snapshot;

use crate::octree::aabb::{Aabb, BoundingVolume, ElevationRange};
use crate::octree::key::VoxelKey;
use crate::octree::node::{Node, NodeAddress, SourceId};
use slab::Slab;

#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct NodeId(pub(crate) usize);

/// Arena holding every node of a layer. Parents own their children through `children`;
/// `parent` is a plain lookup index, so no reference cycles exist.
#[derive(Debug, Default)]
pub struct Octree {
    storage: Slab<Node>,
    roots: Vec<NodeId>,
}

impl Octree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.storage.get(node_id.0)
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.storage.get_mut(node_id.0)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Adds a root for `source` covering `voxel`.
    pub fn insert_root(
        &mut self,
        source: SourceId,
        voxel: Aabb,
        elevation: &ElevationRange,
        num_points: Option<u64>,
        address: NodeAddress,
    ) -> NodeId {
        let mut node = Node::new(VoxelKey::ROOT, source, num_points, address);
        node.bounds = BoundingVolume::new(voxel, elevation);
        let id = NodeId(self.storage.insert(node));
        self.roots.push(id);
        id
    }

    /// Links a new child in `octant` of `parent`, deriving its key and bounding volumes from the
    /// parent. Attaching to an occupied octant returns the existing child untouched.
    pub fn attach(
        &mut self,
        parent: NodeId,
        octant: u8,
        num_points: Option<u64>,
        address: NodeAddress,
        elevation: &ElevationRange,
    ) -> NodeId {
        let octant = octant & 0b111;
        let (key, source, bounds) = {
            let parent_node = self
                .node(parent)
                .expect("attach: parent node not found - invariant broken");
            if let Some(existing) = parent_node.children[octant as usize] {
                return existing;
            }
            (
                parent_node.key.child(octant),
                parent_node.source,
                parent_node.bounds.child(octant, elevation),
            )
        };

        let mut child = Node::new(key, source, num_points, address);
        child.parent = Some(parent);
        child.bounds = bounds;
        let child_id = NodeId(self.storage.insert(child));

        if let Some(parent_node) = self.node_mut(parent) {
            parent_node.children[octant as usize] = Some(child_id);
        }
        child_id
    }

    /// Stable identity of a node within its source.
    pub fn id(&self, node_id: NodeId) -> Option<(SourceId, VoxelKey)> {
        self.node(node_id).map(|node| (node.source, node.key))
    }

    /// Lowest node that has both `a` and `b` in its subtree. Nodes of different sources live in
    /// disjoint trees and never share an ancestor.
    pub fn common_ancestor(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let (mut a, mut b) = (a, b);
        loop {
            let (node_a, node_b) = (self.node(a)?, self.node(b)?);
            if node_a.source != node_b.source {
                return None;
            }
            if node_a.depth() == node_b.depth() {
                if node_a.key == node_b.key {
                    return Some(a);
                }
                a = node_a.parent?;
                b = node_b.parent?;
            } else if node_a.depth() > node_b.depth() {
                a = node_a.parent?;
            } else {
                b = node_b.parent?;
            }
        }
    }

    /// `node_id` followed by all its descendants, depth first.
    pub fn subtree(&self, node_id: NodeId) -> Vec<NodeId> {
        let mut stack = vec![node_id];
        let mut nodes = Vec::new();
        while let Some(id) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            nodes.push(id);
            stack.extend(node.child_ids());
        }
        nodes
    }

    /// Looks a node up by key, walking down from the source root.
    pub fn find(&self, source: SourceId, key: VoxelKey) -> Option<NodeId> {
        let root = *self
            .roots
            .iter()
            .find(|root| self.node(**root).is_some_and(|n| n.source == source))?;

        let mut path = Vec::with_capacity(key.depth as usize);
        let mut cursor = key;
        while let Some(parent) = cursor.parent() {
            path.push(cursor.octant());
            cursor = parent;
        }

        let mut current = root;
        for octant in path.into_iter().rev() {
            current = self.node(current)?.children[octant as usize]?;
        }
        Some(current)
    }

    /// Every node of `source`, roots first within each tree.
    pub fn subtree_of_source(&self, source: SourceId) -> Vec<NodeId> {
        self.roots
            .iter()
            .filter(|root| self.node(**root).is_some_and(|n| n.source == source))
            .flat_map(|root| self.subtree(*root))
            .collect()
    }

    /// Destroys every node belonging to `source`, root included.
    pub fn remove_source(&mut self, source: SourceId) -> usize {
        let nodes = self.subtree_of_source(source);
        for id in &nodes {
            self.storage.remove(id.0);
        }
        self.roots.retain(|root| self.storage.contains(root.0));
        nodes.len()
    }
}
