use crate::octree::aabb::Aabb;
use crate::octree::key::VoxelKey;
use crate::octree::node::SourceId;
use crate::octree::{NodeId, Octree};
use serde::Serialize;

/// Owned copy of a loaded hierarchy, detached from the arena. Serializable for inspection tools.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OctreeNodeSnapshot {
    pub key: VoxelKey,
    pub source: SourceId,
    /// `-1` while the node's hierarchy is unknown.
    pub num_points: i64,
    pub voxel_box: Aabb,
    pub clamped_box: Aabb,
    pub payload_resident: bool,
    pub children: Vec<OctreeNodeSnapshot>,
}

pub struct SnapshotIter<'a> {
    stack: Vec<&'a OctreeNodeSnapshot>,
}

impl<'a> Iterator for SnapshotIter<'a> {
    type Item = &'a OctreeNodeSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        for child in node.children.iter().rev() {
            self.stack.push(child);
        }
        Some(node)
    }
}

impl OctreeNodeSnapshot {
    pub fn iter(&self) -> SnapshotIter<'_> {
        SnapshotIter { stack: vec![self] }
    }
}

impl Octree {
    /// Takes a snapshot of the hierarchy loaded below `node_id`.
    pub fn snapshot(&self, node_id: NodeId) -> Option<OctreeNodeSnapshot> {
        let node = self.node(node_id)?;
        Some(OctreeNodeSnapshot {
            key: node.key,
            source: node.source,
            num_points: node.num_points.map_or(-1, |n| n as i64),
            voxel_box: node.bounds.voxel,
            clamped_box: node.bounds.clamped,
            payload_resident: node.payload.is_some(),
            children: node
                .child_ids()
                .filter_map(|child| self.snapshot(child))
                .collect(),
        })
    }
}
