//! What the traversal needs to know about the viewer.

use crate::octree::aabb::Aabb;
use glam::{DMat4, DVec2, DVec3, DVec4};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProjectionKind {
    /// Vertical field of view, in radians.
    Perspective { fov_y: f64 },
    Orthographic,
}

pub trait View {
    /// Eye position, world space.
    fn position(&self) -> DVec3;

    /// Viewport size in pixels.
    fn viewport(&self) -> DVec2;

    fn projection(&self) -> ProjectionKind;

    fn projection_matrix(&self) -> DMat4;

    /// Whether `aabb`, expressed in the local frame described by `world`, intersects the view.
    fn is_box_visible(&self, aabb: &Aabb, world: &DMat4) -> bool;
}

/// Six clip planes as `(normal, distance)` with normals pointing inwards.
#[derive(Clone, Debug)]
pub struct Frustum {
    pub planes: [DVec4; 6],
}

impl Frustum {
    /// Extracts the planes of a view-projection matrix with a `[0, 1]` depth range.
    pub fn from_view_proj(view_proj: &DMat4) -> Self {
        let m = view_proj.transpose();

        let planes = [
            m.w_axis + m.x_axis,
            m.w_axis - m.x_axis,
            m.w_axis + m.y_axis,
            m.w_axis - m.y_axis,
            m.z_axis,
            m.w_axis - m.z_axis,
        ]
        .map(|plane| plane / plane.truncate().length());

        Self { planes }
    }

    /// True unless the box lies entirely behind one plane.
    pub fn intersects(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let normal = plane.truncate();
            // corner furthest along the normal
            let p = DVec3::select(normal.cmpge(DVec3::ZERO), aabb.max, aabb.min);
            normal.dot(p) + plane.w >= 0.0
        })
    }
}

#[derive(Clone, Debug)]
pub struct Camera {
    position: DVec3,
    projection: DMat4,
    kind: ProjectionKind,
    viewport: DVec2,
    frustum: Frustum,
}

impl Camera {
    pub fn new(
        position: DVec3,
        view: DMat4,
        projection: DMat4,
        kind: ProjectionKind,
        viewport: DVec2,
    ) -> Self {
        Self {
            position,
            projection,
            kind,
            viewport,
            frustum: Frustum::from_view_proj(&(projection * view)),
        }
    }

    pub fn perspective(
        eye: DVec3,
        target: DVec3,
        up: DVec3,
        fov_y: f64,
        viewport: DVec2,
        near: f64,
        far: f64,
    ) -> Self {
        let view = DMat4::look_at_rh(eye, target, up);
        let projection = DMat4::perspective_rh(fov_y, viewport.x / viewport.y, near, far);
        Self::new(eye, view, projection, ProjectionKind::Perspective { fov_y }, viewport)
    }

    /// `half_extent` is half the width and height of the view volume, world units.
    pub fn orthographic(
        eye: DVec3,
        target: DVec3,
        up: DVec3,
        half_extent: DVec2,
        viewport: DVec2,
        near: f64,
        far: f64,
    ) -> Self {
        let view = DMat4::look_at_rh(eye, target, up);
        let projection = DMat4::orthographic_rh(
            -half_extent.x,
            half_extent.x,
            -half_extent.y,
            half_extent.y,
            near,
            far,
        );
        Self::new(eye, view, projection, ProjectionKind::Orthographic, viewport)
    }

    pub fn frustum(&self) -> &Frustum {
        &self.frustum
    }
}

impl View for Camera {
    fn position(&self) -> DVec3 {
        self.position
    }

    fn viewport(&self) -> DVec2 {
        self.viewport
    }

    fn projection(&self) -> ProjectionKind {
        self.kind
    }

    fn projection_matrix(&self) -> DMat4 {
        self.projection
    }

    fn is_box_visible(&self, aabb: &Aabb, world: &DMat4) -> bool {
        self.frustum.intersects(&aabb.transform(world))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Camera {
        Camera::perspective(
            DVec3::new(0.0, 0.0, 10.0),
            DVec3::ZERO,
            DVec3::Y,
            std::f64::consts::FRAC_PI_2,
            DVec2::new(800.0, 800.0),
            0.1,
            100.0,
        )
    }

    fn cube(center: DVec3, half: f64) -> Aabb {
        Aabb::new(center - half, center + half)
    }

    #[test]
    fn boxes_in_front_are_visible() {
        let camera = camera();
        assert!(camera.is_box_visible(&cube(DVec3::ZERO, 1.0), &DMat4::IDENTITY));
        // straddling the left plane
        assert!(camera.is_box_visible(&cube(DVec3::new(-10.0, 0.0, 0.0), 1.0), &DMat4::IDENTITY));
    }

    #[test]
    fn boxes_outside_are_culled() {
        let camera = camera();
        // behind the eye
        assert!(!camera.is_box_visible(&cube(DVec3::new(0.0, 0.0, 20.0), 1.0), &DMat4::IDENTITY));
        // far to the side
        assert!(!camera.is_box_visible(&cube(DVec3::new(50.0, 0.0, 0.0), 1.0), &DMat4::IDENTITY));
        // beyond the far plane
        assert!(!camera.is_box_visible(&cube(DVec3::new(0.0, 0.0, -200.0), 1.0), &DMat4::IDENTITY));
    }

    #[test]
    fn world_matrix_moves_the_box() {
        let camera = camera();
        let local = cube(DVec3::new(50.0, 0.0, 0.0), 1.0);
        let world = DMat4::from_translation(DVec3::new(-50.0, 0.0, 0.0));
        assert!(camera.is_box_visible(&local, &world));
    }
}
