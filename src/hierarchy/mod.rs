//! Hierarchy decoders: one strategy object per wire format, shared by every node of a source.

pub mod copc;
pub mod ept;
pub mod potree;

use crate::octree::aabb::ElevationRange;
use crate::octree::key::VoxelKey;
use crate::octree::node::NodeAddress;
use crate::octree::{NodeId, Octree};
use crate::resource::ResourceError;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Ept,
    Potree,
    Copc,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Ept => "EPT",
            Format::Potree => "Potree",
            Format::Copc => "COPC",
        })
    }
}

#[derive(Error, Debug)]
pub enum ReadHierarchyError {
    #[error("Node does not exists")]
    NodeNotFound,

    #[error("Source of the node is not ready")]
    SourceNotReady,

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Malformed hierarchy: {0}")]
    Malformed(String),

    #[error("Invalid binary data: {0}")]
    InvalidBinaryData(#[from] binrw::error::Error),
}

/// What a node needs to tell a decoder so it can fetch on the node's behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRequest {
    pub key: VoxelKey,
    pub address: NodeAddress,
}

/// Result of materialising one hierarchy buffer below a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Expansion {
    /// Newly linked descendants, in discovery order.
    pub created: Vec<NodeId>,
    /// The buffer ended before every announced node was read.
    pub truncated: bool,
}

#[async_trait]
pub trait HierarchyDecoder: Send + Sync {
    fn format(&self) -> Format;

    /// Address given to a freshly created root.
    fn root_address(&self) -> NodeAddress;

    /// Location of the hierarchy description for a node.
    fn hierarchy_url(&self, request: &NodeRequest) -> String;

    /// Location of the point data for a node.
    fn content_url(&self, request: &NodeRequest) -> String;

    async fn fetch_hierarchy(&self, request: &NodeRequest) -> Result<Vec<u8>, ResourceError>;

    async fn fetch_content(&self, request: &NodeRequest) -> Result<Vec<u8>, ResourceError>;

    /// Links the descendants described by `buf` below `node` and fills in the node's own count.
    /// Must leave `node` with `num_points` set on success.
    fn expand(
        &self,
        octree: &mut Octree,
        node: NodeId,
        buf: &[u8],
        elevation: &ElevationRange,
    ) -> Result<Expansion, ReadHierarchyError>;
}

/// Breadth-first materialisation shared by the key-addressed formats: starting at `node`, every
/// octant whose key `lookup` knows is linked. Children with a known count are expanded further,
/// children whose count is unknown stay leaves until their own hierarchy is fetched.
pub(crate) fn expand_by_key<F>(
    octree: &mut Octree,
    node: NodeId,
    elevation: &ElevationRange,
    mut lookup: F,
) -> Vec<NodeId>
where
    F: FnMut(VoxelKey) -> Option<(Option<u64>, NodeAddress)>,
{
    let mut created = Vec::new();
    let mut queue = std::collections::VecDeque::from([node]);

    while let Some(current) = queue.pop_front() {
        let Some(key) = octree.node(current).map(|n| n.key) else {
            continue;
        };
        for octant in 0..8u8 {
            let Some((num_points, address)) = lookup(key.child(octant)) else {
                continue;
            };
            let expand = num_points.is_some();
            let child = octree.attach(current, octant, num_points, address, elevation);
            created.push(child);
            if expand {
                queue.push_back(child);
            }
        }
    }

    created
}
