use glam::{DMat4, DVec3};
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// `[min_x, min_y, min_z, max_x, max_y, max_z]`, the layout used by EPT, VPC and COPC.
    pub fn from_array(bounds: [f64; 6]) -> Self {
        Self {
            min: DVec3::new(bounds[0], bounds[1], bounds[2]),
            max: DVec3::new(bounds[3], bounds[4], bounds[5]),
        }
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn volume(&self) -> f64 {
        let size = self.size().max(DVec3::ZERO);
        size.x * size.y * size.z
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    /// Euclidean distance from `point` to the box, 0 when inside.
    pub fn distance_to_point(&self, point: DVec3) -> f64 {
        point.clamp(self.min, self.max).distance(point)
    }

    /// Axis-aligned box enclosing the transformed corners.
    pub fn transform(&self, matrix: &DMat4) -> Aabb {
        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        for corner in self.corners() {
            let p = matrix.transform_point3(corner);
            min = min.min(p);
            max = max.max(p);
        }
        Aabb::new(min, max)
    }

    pub fn corners(&self) -> [DVec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            DVec3::new(a.x, a.y, a.z),
            DVec3::new(a.x, a.y, b.z),
            DVec3::new(a.x, b.y, a.z),
            DVec3::new(a.x, b.y, b.z),
            DVec3::new(b.x, a.y, a.z),
            DVec3::new(b.x, a.y, b.z),
            DVec3::new(b.x, b.y, a.z),
            DVec3::new(b.x, b.y, b.z),
        ]
    }
}

/// Child box for `octant` (bit 2 = x, bit 1 = y, bit 0 = z, set bit = upper half).
///
/// Both halves share the same split plane so the eight children tile the parent exactly.
pub fn create_child_aabb(aabb: &Aabb, octant: u8) -> Aabb {
    let mut min = aabb.min;
    let mut max = aabb.max;
    let mid = aabb.min + (aabb.max - aabb.min) * 0.5;

    if (octant & 0b0001) > 0 {
        min.z = mid.z;
    } else {
        max.z = mid.z;
    }
    if (octant & 0b0010) > 0 {
        min.y = mid.y;
    } else {
        max.y = mid.y;
    }
    if (octant & 0b0100) > 0 {
        min.x = mid.x;
    } else {
        max.x = mid.x;
    }

    Aabb::new(min, max)
}

/// Vertical extent of the points actually present in a dataset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ElevationRange {
    pub min: f64,
    pub max: f64,
}

impl Default for ElevationRange {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

impl ElevationRange {
    pub const UNBOUNDED: ElevationRange = ElevationRange {
        min: f64::NEG_INFINITY,
        max: f64::INFINITY,
    };

    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Restricts the vertical range of `voxel`. Only ever shrinks the box, so the result stays
    /// inside `voxel` even when the box lies outside the range.
    pub fn clamp(&self, voxel: &Aabb) -> Aabb {
        let mut clamped = *voxel;
        if clamped.min.z < self.max {
            clamped.max.z = clamped.max.z.min(self.max);
        }
        if clamped.max.z > self.min {
            clamped.min.z = clamped.min.z.max(self.min);
        }
        clamped
    }

    pub fn union(&self, other: &ElevationRange) -> ElevationRange {
        ElevationRange::new(self.min.min(other.min), self.max.max(other.max))
    }
}

/// Voxel box from pure subdivision plus its elevation-clamped counterpart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BoundingVolume {
    pub voxel: Aabb,
    pub clamped: Aabb,
}

impl BoundingVolume {
    pub fn new(voxel: Aabb, elevation: &ElevationRange) -> Self {
        Self {
            voxel,
            clamped: elevation.clamp(&voxel),
        }
    }

    pub fn child(&self, octant: u8, elevation: &ElevationRange) -> Self {
        Self::new(create_child_aabb(&self.voxel, octant), elevation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_cube() -> Aabb {
        Aabb::new(DVec3::new(-3.0, 10.0, 100.0), DVec3::new(5.0, 14.0, 108.0))
    }

    #[test]
    fn children_partition_the_parent() {
        let parent = unit_cube();
        let children: Vec<Aabb> = (0..8).map(|o| create_child_aabb(&parent, o)).collect();

        let total: f64 = children.iter().map(Aabb::volume).sum();
        assert!((total - parent.volume()).abs() < 1e-9);

        for (i, a) in children.iter().enumerate() {
            assert!(parent.contains(a));
            for b in &children[i + 1..] {
                let overlap = Aabb::new(a.min.max(b.min), a.max.min(b.max));
                assert_eq!(overlap.volume(), 0.0);
            }
        }
    }

    #[test]
    fn octant_bits_select_upper_halves() {
        let parent = unit_cube();
        let c = create_child_aabb(&parent, 0b001);
        assert_eq!(c.min, DVec3::new(-3.0, 10.0, 104.0));
        assert_eq!(c.max, DVec3::new(1.0, 12.0, 108.0));

        let c = create_child_aabb(&parent, 0b110);
        assert_eq!(c.min, DVec3::new(1.0, 12.0, 100.0));
        assert_eq!(c.max, DVec3::new(5.0, 14.0, 104.0));
    }

    #[test]
    fn clamp_stays_inside_voxel() {
        let voxel = unit_cube();
        for (min, max) in [(102.0, 104.0), (90.0, 95.0), (110.0, 120.0), (50.0, 200.0)] {
            let clamped = ElevationRange::new(min, max).clamp(&voxel);
            assert!(clamped.min.z >= voxel.min.z && clamped.max.z <= voxel.max.z);
            assert_eq!(clamped.min.x, voxel.min.x);
            assert_eq!(clamped.max.y, voxel.max.y);
        }

        let clamped = ElevationRange::new(102.0, 104.0).clamp(&voxel);
        assert_eq!((clamped.min.z, clamped.max.z), (102.0, 104.0));
    }

    #[test]
    fn distance_is_zero_inside() {
        let b = unit_cube();
        assert_eq!(b.distance_to_point(b.center()), 0.0);
        assert!((b.distance_to_point(DVec3::new(8.0, 12.0, 104.0)) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn transform_translates_box() {
        let b = unit_cube().transform(&DMat4::from_translation(DVec3::new(1.0, 0.0, -100.0)));
        assert_eq!(b.min, DVec3::new(-2.0, 10.0, 0.0));
        assert_eq!(b.max, DVec3::new(6.0, 14.0, 8.0));
    }
}
