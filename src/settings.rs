use crate::octree::aabb::ElevationRange;
use crate::resource::NetworkOptions;
use serde::Deserialize;
use std::time::Duration;

/// Per layer refinement and streaming options. Every field has a default, so a partial json
/// object is a valid configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerSettings {
    /// Nodes whose screen space error reaches this many pixels are refined.
    pub sse_threshold: f64,
    /// On screen footprint of one point, in pixels.
    pub point_size: f64,
    /// Deepest level that is ever displayed.
    pub octree_depth_limit: Option<u32>,
    /// Milliseconds a payload stays resident after it was last seen.
    pub eviction_delay: u64,
    /// Lower bound of the camera distance used for load priorities.
    pub min_distance: f64,
    /// `[min, max]` replacing the elevation range read from the dataset.
    pub elevation_range: Option<[f64; 2]>,
    pub network_options: NetworkOptions,
}

impl Default for LayerSettings {
    fn default() -> Self {
        Self {
            sse_threshold: 2.0,
            point_size: 2.0,
            octree_depth_limit: None,
            eviction_delay: 10_000,
            min_distance: 0.001,
            elevation_range: None,
            network_options: NetworkOptions::default(),
        }
    }
}

impl LayerSettings {
    pub fn eviction_delay(&self) -> Duration {
        Duration::from_millis(self.eviction_delay)
    }

    /// The configured override, or `dataset` when there is none.
    pub fn elevation(&self, dataset: ElevationRange) -> ElevationRange {
        match self.elevation_range {
            Some([min, max]) => ElevationRange::new(min, max),
            None => dataset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_json_uses_defaults() {
        let settings: LayerSettings = serde_json::from_value(json!({
            "sseThreshold": 1.5,
            "octreeDepthLimit": 12,
            "networkOptions": { "headers": { "Authorization": "Bearer x" } }
        }))
        .unwrap();

        assert_eq!(settings.sse_threshold, 1.5);
        assert_eq!(settings.point_size, 2.0);
        assert_eq!(settings.octree_depth_limit, Some(12));
        assert_eq!(settings.eviction_delay(), Duration::from_secs(10));
        assert!(settings.network_options.headers().is_some());
    }

    #[test]
    fn elevation_override() {
        let dataset = ElevationRange::new(0.0, 10.0);
        assert_eq!(LayerSettings::default().elevation(dataset), dataset);

        let settings = LayerSettings {
            elevation_range: Some([2.0, 3.0]),
            ..Default::default()
        };
        assert_eq!(settings.elevation(dataset), ElevationRange::new(2.0, 3.0));
    }
}
