use crate::octree::aabb::{Aabb, BoundingVolume};
use crate::octree::key::VoxelKey;
use crate::octree::NodeId;
use crate::point::PointBuffer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Index of a source (dataset or composite tile) inside its layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct SourceId(pub usize);

/// Byte range inside a shared binary stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
}

/// Format specific location data, filled in by the hierarchy decoder that discovered the node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NodeAddress {
    /// Composite tile root whose own metadata has not been fetched yet.
    #[default]
    Pending,
    /// Everything is derived from the voxel key.
    Ept,
    Potree {
        /// `r` followed by one octant digit per level.
        name: String,
        /// Folder, relative to the octree directory, holding this node's files.
        folder: String,
        child_mask: u8,
    },
    Copc {
        /// Hierarchy page describing this node, until it has been expanded.
        page: Option<Chunk>,
        /// Compressed point data.
        data: Option<Chunk>,
    },
}

/// Shared cancellation flag. Cheap to clone and safe to read from a scheduler thread.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Whether both handles come from the same `new` call.
    pub fn same(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Visibility as last decided by the traversal, readable from early-drop predicates.
#[derive(Clone, Debug)]
pub struct VisibilityFlag(Arc<AtomicBool>);

impl VisibilityFlag {
    pub fn new(visible: bool) -> Self {
        Self(Arc::new(AtomicBool::new(visible)))
    }

    pub fn set(&self, visible: bool) {
        self.0.store(visible, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for VisibilityFlag {
    fn default() -> Self {
        Self::new(false)
    }
}

#[derive(Clone, Debug, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading(CancellationToken),
    Loaded,
    Failed,
}

impl LoadState {
    pub fn is_idle(&self) -> bool {
        matches!(self, LoadState::Idle)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading(_))
    }

    /// Whether this state is the load started with `token`.
    pub fn is_loading_with(&self, token: &CancellationToken) -> bool {
        matches!(self, LoadState::Loading(current) if current.same(token))
    }
}

/// Decoded points attached to a node, plus whether they are currently drawn.
#[derive(Clone, Debug)]
pub struct Payload {
    pub buffer: PointBuffer,
    pub visible: bool,
}

#[derive(Debug)]
pub struct Node {
    pub key: VoxelKey,
    pub source: SourceId,
    /// `None` until the node's hierarchy has been read.
    pub num_points: Option<u64>,
    pub children: [Option<NodeId>; 8],
    pub parent: Option<NodeId>,
    pub bounds: BoundingVolume,
    /// Box of the resident points, kept after eviction so culling does not flip between boxes.
    pub tight_box: Option<Aabb>,
    pub sse: f64,
    pub hierarchy: LoadState,
    pub content: LoadState,
    pub payload: Option<Payload>,
    pub not_visible_since: Option<Instant>,
    pub visible: VisibilityFlag,
    pub address: NodeAddress,
}

impl Node {
    pub fn new(key: VoxelKey, source: SourceId, num_points: Option<u64>, address: NodeAddress) -> Self {
        Self {
            key,
            source,
            num_points,
            children: [None; 8],
            parent: None,
            bounds: BoundingVolume::default(),
            tight_box: None,
            sse: -1.0,
            hierarchy: if num_points.is_some() {
                LoadState::Loaded
            } else {
                LoadState::Idle
            },
            content: LoadState::Idle,
            payload: None,
            not_visible_since: None,
            visible: VisibilityFlag::default(),
            address,
        }
    }

    pub fn depth(&self) -> u32 {
        self.key.depth
    }

    pub fn hierarchy_loaded(&self) -> bool {
        self.num_points.is_some()
    }

    pub fn has_children(&self) -> bool {
        self.children.iter().any(Option::is_some)
    }

    pub fn child_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().flatten().copied()
    }

    /// Tight box of the realised points when known, the clamped voxel box otherwise.
    pub fn best_box(&self) -> Aabb {
        self.tight_box.unwrap_or(self.bounds.clamped)
    }

    /// Nominal spacing between points at this node's depth.
    pub fn point_spacing(&self, source_spacing: f64) -> f64 {
        source_spacing / 2f64.powi(self.key.depth as i32)
    }

    /// Hides the payload and stamps the first frame it went missing.
    pub(crate) fn mark_invisible(&mut self, now: Instant) {
        if let Some(payload) = self.payload.as_mut() {
            payload.visible = false;
        }
        self.visible.set(false);
        if self.not_visible_since.is_none() {
            self.not_visible_since = Some(now);
            self.sse = -1.0;
        }
    }
}
