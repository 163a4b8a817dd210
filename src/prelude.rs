pub use crate::camera::{Camera, ProjectionKind, View};
pub use crate::layer::{LayerId, PointCloudLayer};
pub use crate::loader::{ImmediateScheduler, LoadOrchestrator, LoadRequest, Scheduler};
pub use crate::octree::snapshot::OctreeNodeSnapshot;
pub use crate::point::{PointBuffer, PointData, PointParser};
pub use crate::resource::{NetworkOptions, ResourceClient};
pub use crate::settings::LayerSettings;
pub use crate::traversal::{refine, Change, FrameReport};

// Error types
pub use crate::hierarchy::ReadHierarchyError;
pub use crate::loader::CommandError;
pub use crate::point::LoadPointsError;
pub use crate::resource::ResourceError;
pub use crate::source::LoadSourceError;
