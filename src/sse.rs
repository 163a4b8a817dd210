//! Screen space error: how far apart, in pixels, two neighbouring points of a node appear.

use crate::camera::{ProjectionKind, View};
use glam::DVec4;

/// Pixels covered by one world unit seen at distance 1 (perspective only).
pub fn pre_sse(viewport_height: f64, fov_y: f64) -> f64 {
    viewport_height / (2.0 * (fov_y * 0.5).tan())
}

/// Infinite when the camera is inside or touching the box.
pub fn perspective_sse(pre_sse: f64, spacing: f64, distance: f64, point_size: f64) -> f64 {
    if distance <= 0.0 {
        return f64::INFINITY;
    }
    let on_screen = pre_sse * spacing / distance;
    (on_screen - point_size).max(0.0)
}

/// Projects `spacing` through the projection matrix alone, so the result does not depend on
/// where the node is.
pub fn orthographic_sse(view: &dyn View, spacing: f64, point_size: f64) -> f64 {
    let v = view.projection_matrix() * DVec4::new(spacing, 0.0, 0.0, 1.0);
    let viewport = view.viewport();
    let dx = v.x * 0.5 * viewport.x;
    let dy = v.y * 0.5 * viewport.y;
    ((dx * dx + dy * dy).sqrt() - point_size).max(0.0)
}

pub fn screen_space_error(
    view: &dyn View,
    pre_sse: f64,
    spacing: f64,
    distance: f64,
    point_size: f64,
) -> f64 {
    match view.projection() {
        ProjectionKind::Orthographic => orthographic_sse(view, spacing, point_size),
        ProjectionKind::Perspective { .. } => perspective_sse(pre_sse, spacing, distance, point_size),
    }
}

/// Near and coarse nodes first.
pub fn load_priority(sse: f64, distance: f64, min_distance: f64) -> f64 {
    sse / distance.max(min_distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use glam::{DVec2, DVec3};

    #[test]
    fn pre_sse_matches_viewport() {
        // 90 degrees: half the viewport height per unit at distance 1
        let factor = pre_sse(1000.0, std::f64::consts::FRAC_PI_2);
        assert!((factor - 500.0).abs() < 1e-9);
    }

    #[test]
    fn perspective_is_infinite_at_zero_distance() {
        assert_eq!(perspective_sse(500.0, 1.0, 0.0, 2.0), f64::INFINITY);
        assert_eq!(perspective_sse(500.0, 1.0, -3.0, 2.0), f64::INFINITY);
    }

    #[test]
    fn perspective_decreases_with_distance() {
        let mut previous = f64::INFINITY;
        for step in 1..200 {
            let distance = step as f64 * 0.5;
            let sse = perspective_sse(500.0, 1.0, distance, 2.0);
            assert!(sse <= previous, "sse grew at distance {}", distance);
            assert!(sse >= 0.0);
            previous = sse;
        }
        assert_eq!(perspective_sse(500.0, 1.0, 1000.0, 2.0), 0.0);
    }

    #[test]
    fn orthographic_ignores_distance() {
        let camera = Camera::orthographic(
            DVec3::new(0.0, 0.0, 100.0),
            DVec3::ZERO,
            DVec3::Y,
            DVec2::new(50.0, 25.0),
            DVec2::new(1000.0, 500.0),
            0.1,
            1000.0,
        );
        // the view spans 100 units over 1000 pixels: one unit is 10 pixels
        let near = screen_space_error(&camera, 0.0, 1.0, 1.0, 2.0);
        let far = screen_space_error(&camera, 0.0, 1.0, 500.0, 2.0);
        assert!((near - 8.0).abs() < 1e-9);
        assert_eq!(near, far);
    }

    #[test]
    fn priority_clamps_distance() {
        assert_eq!(load_priority(2.0, 0.0, 0.001), 2000.0);
        assert_eq!(load_priority(2.0, 4.0, 0.001), 0.5);
    }
}
