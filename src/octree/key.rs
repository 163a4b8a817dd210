use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Octree cell address: depth plus integer cell coordinates at that depth.
///
/// Displayed as `depth-x-y-z`, the EPT voxel key form. The separator keeps keys unambiguous for
/// multi-digit coordinates (`1-23-0-0` vs `12-3-0-0`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VoxelKey {
    pub depth: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl VoxelKey {
    pub const ROOT: VoxelKey = VoxelKey {
        depth: 0,
        x: 0,
        y: 0,
        z: 0,
    };

    pub fn new(depth: u32, x: u32, y: u32, z: u32) -> Self {
        Self { depth, x, y, z }
    }

    /// Key of the child in `octant` (bit 2 = x, bit 1 = y, bit 0 = z).
    pub fn child(&self, octant: u8) -> VoxelKey {
        VoxelKey {
            depth: self.depth + 1,
            x: self.x * 2 + u32::from((octant >> 2) & 1),
            y: self.y * 2 + u32::from((octant >> 1) & 1),
            z: self.z * 2 + u32::from(octant & 1),
        }
    }

    pub fn parent(&self) -> Option<VoxelKey> {
        (self.depth > 0).then(|| VoxelKey {
            depth: self.depth - 1,
            x: self.x / 2,
            y: self.y / 2,
            z: self.z / 2,
        })
    }

    /// Octant of this key inside its parent.
    pub fn octant(&self) -> u8 {
        (((self.x & 1) << 2) | ((self.y & 1) << 1) | (self.z & 1)) as u8
    }
}

impl fmt::Display for VoxelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.depth, self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid voxel key: {0:?}")]
pub struct ParseVoxelKeyError(pub String);

impl FromStr for VoxelKey {
    type Err = ParseVoxelKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-').map(str::parse::<u32>);
        let mut next = || {
            parts
                .next()
                .and_then(Result::ok)
                .ok_or_else(|| ParseVoxelKeyError(s.to_string()))
        };
        let key = VoxelKey::new(next()?, next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(ParseVoxelKeyError(s.to_string()));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn child_and_parent_round_trip() {
        let key = VoxelKey::new(3, 5, 2, 7);
        for octant in 0..8 {
            let child = key.child(octant);
            assert_eq!(child.octant(), octant);
            assert_eq!(child.parent(), Some(key));
        }
        assert_eq!(VoxelKey::ROOT.parent(), None);
    }

    #[test]
    fn keys_are_unique_across_depths() {
        let mut seen = HashSet::new();
        let mut frontier = vec![VoxelKey::ROOT];
        for _ in 0..3 {
            let mut next = Vec::new();
            for key in frontier {
                assert!(seen.insert(key.to_string()));
                next.extend((0..8).map(|o| key.child(o)));
            }
            frontier = next;
        }
        assert_eq!(seen.len(), 1 + 8 + 64);
    }

    #[test]
    fn separator_disambiguates_digits() {
        assert_ne!(
            VoxelKey::new(1, 23, 0, 0).to_string(),
            VoxelKey::new(12, 3, 0, 0).to_string()
        );
    }

    #[test]
    fn parses_display_form() {
        assert_eq!("2-1-0-3".parse::<VoxelKey>(), Ok(VoxelKey::new(2, 1, 0, 3)));
        assert!("2-1-0".parse::<VoxelKey>().is_err());
        assert!("2-1-0-3-4".parse::<VoxelKey>().is_err());
        assert!("r0123".parse::<VoxelKey>().is_err());
    }
}
