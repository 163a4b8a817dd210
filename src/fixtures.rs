//! Small in-memory datasets shared by the layer, traversal and loader tests.

use crate::camera::Camera;
use crate::composite::tests::index_json;
use crate::layer::{LayerId, PointCloudLayer};
use crate::point::{LoadPointsError, ParseContext, PointBuffer, PointData, PointParser};
use crate::resource::memory::MemoryClient;
use crate::settings::LayerSettings;
use glam::{DVec2, DVec3};
use serde_json::json;

pub const EPT_URL: &str = "mem://ept/ept.json";
pub const VPC_URL: &str = "mem://vpc/index.vpc";

/// Keys with point data in the EPT fixture. `1-0-1-0` has its own hierarchy document.
pub const EPT_KEYS: [&str; 6] = ["0-0-0-0", "1-0-0-0", "1-1-1-1", "2-0-0-0", "1-0-1-0", "2-0-2-0"];

/// 64 unit cube with root spacing 1:
/// `0-0-0-0` → `1-0-0-0` → `2-0-0-0`, `1-1-1-1`, and `1-0-1-0` → `2-0-2-0` behind a `-1`.
pub fn ept_client() -> MemoryClient {
    let client = MemoryClient::new();
    client.insert_json(
        EPT_URL,
        &json!({
            "bounds": [0, 0, 0, 64, 64, 64],
            "boundsConforming": [0, 0, 0, 64, 64, 64],
            "dataType": "laszip",
            "hierarchyType": "json",
            "points": 235,
            "span": 64
        }),
    );
    client.insert_json(
        "mem://ept/ept-hierarchy/0-0-0-0.json",
        &json!({
            "0-0-0-0": 100,
            "1-0-0-0": 50,
            "1-1-1-1": 40,
            "2-0-0-0": 10,
            "1-0-1-0": -1
        }),
    );
    client.insert_json(
        "mem://ept/ept-hierarchy/1-0-1-0.json",
        &json!({ "1-0-1-0": 30, "2-0-2-0": 5 }),
    );
    for key in EPT_KEYS {
        client.insert(format!("mem://ept/ept-data/{}.laz", key), key.as_bytes().to_vec());
    }
    client
}

/// Two EPT tiles side by side along x.
pub fn vpc_client() -> MemoryClient {
    let client = MemoryClient::new();
    let mut index = index_json();
    index["features"][1]["assets"]["data"]["href"] = json!("./b/ept.json");
    client.insert_json(VPC_URL, &index);

    for (tile, x0) in [("a", 0), ("b", 16)] {
        client.insert_json(
            format!("mem://vpc/{}/ept.json", tile),
            &json!({
                "bounds": [x0, 0, 0, x0 + 16, 16, 16],
                "boundsConforming": [x0, 0, 2, x0 + 16, 16, 9],
                "dataType": "laszip",
                "span": 16
            }),
        );
        client.insert_json(
            format!("mem://vpc/{}/ept-hierarchy/0-0-0-0.json", tile),
            &json!({ "0-0-0-0": 20, "1-0-0-0": 5 }),
        );
    }
    client
}

pub async fn ept_layer(settings: LayerSettings) -> (PointCloudLayer<MemoryClient>, MemoryClient) {
    let client = ept_client();
    let layer = PointCloudLayer::open(LayerId(1), EPT_URL, client.clone(), settings)
        .await
        .unwrap();
    (layer, client)
}

/// Settings under which every visible node is refined.
pub fn eager_settings() -> LayerSettings {
    LayerSettings {
        sse_threshold: 1e-6,
        point_size: 0.0,
        ..Default::default()
    }
}

/// Above the dataset, looking down, everything in view.
pub fn overview_camera() -> Camera {
    Camera::perspective(
        DVec3::new(32.0, 32.0, 200.0),
        DVec3::new(32.0, 32.0, 0.0),
        DVec3::Y,
        60f64.to_radians(),
        DVec2::new(1000.0, 1000.0),
        0.1,
        10_000.0,
    )
}

/// Looking away from the dataset.
pub fn away_camera() -> Camera {
    Camera::perspective(
        DVec3::new(32.0, 32.0, 200.0),
        DVec3::new(32.0, 32.0, 400.0),
        DVec3::Y,
        60f64.to_radians(),
        DVec2::new(1000.0, 1000.0),
        0.1,
        10_000.0,
    )
}

/// Emits the two corners of the voxel box; fails on `corrupt` content.
pub struct CornerParser;

impl PointParser for CornerParser {
    fn parse(&self, bytes: Vec<u8>, context: &ParseContext) -> Result<PointBuffer, LoadPointsError> {
        if bytes == b"corrupt" {
            return Err(LoadPointsError::Parse(format!("{} is corrupt", context.key)));
        }
        let shrink = context.voxel_box.size() * 0.25;
        Ok(PointBuffer::from_points(vec![
            PointData {
                position: context.voxel_box.min + shrink,
                ..Default::default()
            },
            PointData {
                position: context.voxel_box.max - shrink,
                ..Default::default()
            },
        ]))
    }
}
