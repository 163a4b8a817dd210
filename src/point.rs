use crate::hierarchy::Format;
use crate::octree::aabb::Aabb;
use crate::octree::key::VoxelKey;
use crate::octree::node::SourceId;
use crate::resource::ResourceError;
use glam::{DVec3, U8Vec3};
use thiserror::Error;

#[derive(Clone, Debug, Default)]
pub struct PointData {
    pub position: DVec3,
    pub color: U8Vec3,
}

/// Decoded content of one node.
#[derive(Clone, Debug, Default)]
pub struct PointBuffer {
    pub points: Vec<PointData>,
    /// Box of the points actually present, usually much tighter than the voxel box.
    pub tight_box: Aabb,
}

impl PointBuffer {
    pub fn new(points: Vec<PointData>, tight_box: Aabb) -> Self {
        Self { points, tight_box }
    }

    /// Builds a buffer whose tight box is computed from the points.
    pub fn from_points(points: Vec<PointData>) -> Self {
        let tight_box = points.iter().fold(
            Aabb::new(DVec3::splat(f64::INFINITY), DVec3::splat(f64::NEG_INFINITY)),
            |acc, p| Aabb::new(acc.min.min(p.position), acc.max.max(p.position)),
        );
        Self { points, tight_box }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Everything a format parser may need besides the raw bytes.
#[derive(Clone, Debug)]
pub struct ParseContext {
    pub format: Format,
    pub source: SourceId,
    pub key: VoxelKey,
    pub num_points: u64,
    pub voxel_box: Aabb,
}

/// Turns the bytes of one node into points. Implementations live outside this crate.
pub trait PointParser: Send + Sync {
    fn parse(&self, bytes: Vec<u8>, context: &ParseContext) -> Result<PointBuffer, LoadPointsError>;
}

#[derive(Error, Debug)]
pub enum LoadPointsError {
    #[error("Node does not exists")]
    NodeNotFound,

    #[error("Source of the node is not ready")]
    SourceNotReady,

    #[error("Hierarchy of the node is not loaded")]
    HierarchyNotLoaded,

    #[error("Node has no point data")]
    EmptyNode,

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Unable to parse points: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tight_box_encloses_points() {
        let buffer = PointBuffer::from_points(vec![
            PointData {
                position: DVec3::new(1.0, -2.0, 3.0),
                ..Default::default()
            },
            PointData {
                position: DVec3::new(-1.0, 4.0, 0.5),
                ..Default::default()
            },
        ]);
        assert_eq!(buffer.tight_box.min, DVec3::new(-1.0, -2.0, 0.5));
        assert_eq!(buffer.tight_box.max, DVec3::new(1.0, 4.0, 3.0));
        assert_eq!(buffer.len(), 2);
    }
}
