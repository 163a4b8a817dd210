//! Per frame refinement: decides which nodes are drawn, which are hidden and what has to be
//! fetched next.

use crate::camera::{ProjectionKind, View};
use crate::layer::{LayerId, PointCloudLayer, SourceState, TraversalConfig};
use crate::loader::LoadRequest;
use crate::octree::NodeId;
use crate::sse::{load_priority, pre_sse, screen_space_error};
use glam::DVec3;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, span, trace, Level};

/// Something that changed since the previous frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Camera,
    /// Layer wide change: settings, transform, visibility.
    Layer(LayerId),
    /// Content or hierarchy of one node.
    Node(LayerId, NodeId),
}

/// State shared by every node visit of one frame.
pub struct FrameContext<'a> {
    pub view: &'a dyn View,
    pub now: Instant,
    pub pre_sse: f64,
    /// Camera position in the layer's local frame.
    pub eye: DVec3,
    pub config: TraversalConfig,
    pub requests: Vec<LoadRequest>,
    /// Nodes waiting for their composite tile to open.
    pub deferred: Vec<NodeId>,
}

impl<'a> FrameContext<'a> {
    pub fn new<C>(view: &'a dyn View, layer: &PointCloudLayer<C>, now: Instant) -> Self {
        let pre_sse = match view.projection() {
            ProjectionKind::Perspective { fov_y } => pre_sse(view.viewport().y, fov_y),
            ProjectionKind::Orthographic => 0.0,
        };
        let eye = layer.transform().inverse().transform_point3(view.position());
        Self {
            view,
            now,
            pre_sse,
            eye,
            config: layer.traversal_config(),
            requests: Vec::new(),
            deferred: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameReport {
    /// Nodes the pass started from.
    pub frontier: Vec<NodeId>,
    pub visited: usize,
    pub deferred: Vec<NodeId>,
    /// Loads to start, in visit order.
    pub requests: Vec<LoadRequest>,
}

impl<C> PointCloudLayer<C> {
    /// Where this frame's pass starts. The whole forest after a camera or layer change, the
    /// lowest common ancestor of the changed nodes otherwise.
    pub fn pre_update(&self, changes: &[Change]) -> Vec<NodeId> {
        let everything = || self.roots().to_vec();

        if changes
            .iter()
            .any(|change| matches!(change, Change::Camera) || *change == Change::Layer(self.id))
        {
            return everything();
        }

        let mut nodes = changes.iter().filter_map(|change| match change {
            Change::Node(layer, node) if *layer == self.id => Some(*node),
            _ => None,
        });
        let Some(first) = nodes.next() else {
            return everything();
        };
        if self.octree.node(first).is_none() {
            return everything();
        }

        let mut common = first;
        for node in nodes {
            match self.octree.common_ancestor(common, node) {
                Some(ancestor) => common = ancestor,
                None => return everything(),
            }
        }
        vec![common]
    }

    /// Visits one node and returns the children to visit next.
    pub fn update(&mut self, ctx: &mut FrameContext<'_>, node_id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.octree.node(node_id) else {
            return Vec::new();
        };
        node.visible.set(false);

        if ctx.config.depth_limit.is_some_and(|limit| node.depth() > limit) {
            self.hide_subtree(node_id, ctx.now);
            return Vec::new();
        }

        let best_box = node.best_box();
        if !ctx.view.is_box_visible(&best_box, &self.transform) {
            self.hide_subtree(node_id, ctx.now);
            return Vec::new();
        }

        let source = node.source;
        let Some(root_spacing) = ctx.config.spacing.get(source.0).copied().flatten() else {
            if matches!(
                self.sources.get(source.0).map(|slot| &slot.state),
                Some(SourceState::Pending)
            ) {
                ctx.requests.push(LoadRequest::Bootstrap { source });
            }
            ctx.deferred.push(node_id);
            return Vec::new();
        };

        let distance = best_box.distance_to_point(ctx.eye);
        let Some(node) = self.octree.node_mut(node_id) else {
            return Vec::new();
        };
        node.visible.set(true);
        node.not_visible_since = None;
        let spacing = node.point_spacing(root_spacing);
        node.sse = screen_space_error(ctx.view, ctx.pre_sse, spacing, distance, ctx.config.point_size);

        match node.num_points {
            None => {
                if node.hierarchy.is_idle() {
                    ctx.requests.push(LoadRequest::Hierarchy { node: node_id });
                }
            }
            Some(0) => {}
            Some(_) => {
                if let Some(payload) = node.payload.as_mut() {
                    payload.visible = true;
                } else if node.content.is_idle() {
                    // finite even with the eye inside the box
                    let clamped = distance.max(ctx.config.min_distance);
                    let sse = screen_space_error(
                        ctx.view,
                        ctx.pre_sse,
                        spacing,
                        clamped,
                        ctx.config.point_size,
                    );
                    ctx.requests.push(LoadRequest::Points {
                        node: node_id,
                        priority: load_priority(sse, clamped, ctx.config.min_distance),
                    });
                }
            }
        }

        let children: Vec<NodeId> = node.child_ids().collect();
        if children.is_empty() || node.sse >= ctx.config.sse_threshold {
            return children;
        }
        trace!("pruning below {} (sse {:.3})", node.key, node.sse);
        for child in children {
            self.hide_subtree(child, ctx.now);
        }
        Vec::new()
    }
}

/// Runs one frame pass over `layer`. Visiting descends breadth first from the frontier through
/// every refined node, so the returned requests come coarse levels first.
pub fn refine<C>(
    layer: &mut PointCloudLayer<C>,
    view: &dyn View,
    changes: &[Change],
    now: Instant,
) -> FrameReport {
    let span = span!(Level::TRACE, "refine", layer = layer.id().0);
    let _enter = span.enter();

    if !layer.is_visible() {
        for root in layer.roots().to_vec() {
            layer.hide_subtree(root, now);
        }
        return FrameReport::default();
    }

    let frontier = layer.pre_update(changes);
    let mut ctx = FrameContext::new(view, layer, now);
    let mut queue: VecDeque<NodeId> = frontier.iter().copied().collect();
    let mut visited = 0;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        queue.extend(layer.update(&mut ctx, node));
    }

    debug!(
        "{} nodes visited, {} loads requested, {} deferred",
        visited,
        ctx.requests.len(),
        ctx.deferred.len()
    );
    FrameReport {
        frontier,
        visited,
        deferred: ctx.deferred,
        requests: ctx.requests,
    }
}
