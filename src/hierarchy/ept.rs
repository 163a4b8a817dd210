//! Entwine Point Tile: one json request returns the point counts of a whole subtree.

use crate::hierarchy::{
    expand_by_key, Expansion, Format, HierarchyDecoder, NodeRequest, ReadHierarchyError,
};
use crate::octree::aabb::{Aabb, ElevationRange};
use crate::octree::key::VoxelKey;
use crate::octree::node::NodeAddress;
use crate::octree::{NodeId, Octree};
use crate::resource::{NetworkOptions, ResourceClient, ResourceError};
use crate::source::{LoadSourceError, OpenedSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{span, trace, warn, Level};

/// The parts of `ept.json` needed to stream the octree.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EptMetadata {
    /// Cubic bounds of the octree root.
    pub bounds: [f64; 6],
    /// Bounds of the points themselves.
    pub bounds_conforming: [f64; 6],
    pub data_type: String,
    #[serde(default = "default_hierarchy_type")]
    pub hierarchy_type: String,
    #[serde(default)]
    pub points: u64,
    pub span: u32,
}

fn default_hierarchy_type() -> String {
    "json".to_string()
}

impl EptMetadata {
    pub fn spacing(&self) -> f64 {
        let b = &self.bounds;
        ((b[3] - b[0]).abs() + (b[4] - b[1]).abs()) / (2.0 * self.span as f64)
    }

    pub fn elevation(&self) -> ElevationRange {
        ElevationRange::new(self.bounds_conforming[2], self.bounds_conforming[5])
    }

    /// File extension of the point data for `dataType`.
    pub fn extension(&self) -> Result<&'static str, LoadSourceError> {
        match self.data_type.as_str() {
            "laszip" => Ok("laz"),
            "binary" => Ok("bin"),
            "zstandard" => Ok("zst"),
            other => Err(LoadSourceError::UnsupportedFormat(format!(
                "EPT dataType {:?}",
                other
            ))),
        }
    }
}

pub struct EptDecoder<C> {
    base_url: String,
    extension: &'static str,
    client: C,
    options: NetworkOptions,
}

impl<C: ResourceClient + 'static> EptDecoder<C> {
    /// `base_url` is the directory holding `ept.json`.
    pub fn new(
        base_url: &str,
        metadata: &EptMetadata,
        client: C,
        options: NetworkOptions,
    ) -> Result<Self, LoadSourceError> {
        if metadata.hierarchy_type != "json" {
            return Err(LoadSourceError::UnsupportedFormat(format!(
                "EPT hierarchyType {:?}",
                metadata.hierarchy_type
            )));
        }
        if metadata.span == 0 {
            return Err(LoadSourceError::InvalidMetadata("EPT span is 0".to_string()));
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            extension: metadata.extension()?,
            client,
            options,
        })
    }

    /// Reads `ept.json` from `url` (either the dataset directory or the file itself).
    pub async fn open(
        url: &str,
        client: C,
        options: NetworkOptions,
    ) -> Result<OpenedSource, LoadSourceError> {
        let base_url = url
            .trim_end_matches('/')
            .strip_suffix("ept.json")
            .map(|base| base.trim_end_matches('/'))
            .unwrap_or(url.trim_end_matches('/'));

        let metadata: EptMetadata = client
            .get_json(&format!("{}/ept.json", base_url), options.headers())
            .await
            .map_err(LoadSourceError::LoadMetadata)?;

        let decoder = Self::new(base_url, &metadata, client, options)?;
        Ok(decoder.into_source(&metadata))
    }

    pub fn into_source(self, metadata: &EptMetadata) -> OpenedSource {
        OpenedSource {
            decoder: Arc::new(self),
            bounds: Aabb::from_array(metadata.bounds),
            spacing: metadata.spacing(),
            elevation: metadata.elevation(),
        }
    }
}

/// Parses an EPT hierarchy document into counts per key. `-1` marks a node whose own subtree
/// lives in a separate document.
fn parse_counts(buf: &[u8]) -> Result<HashMap<VoxelKey, i64>, ReadHierarchyError> {
    let raw: HashMap<String, i64> = serde_json::from_slice(buf).map_err(|e| {
        ReadHierarchyError::Malformed(format!("EPT hierarchy is not a key/count map: {}", e))
    })?;

    let mut counts = HashMap::with_capacity(raw.len());
    for (key, count) in raw {
        match key.parse::<VoxelKey>() {
            Ok(voxel_key) => {
                counts.insert(voxel_key, count);
            }
            Err(error) => warn!("skipping EPT hierarchy entry: {}", error),
        }
    }
    Ok(counts)
}

#[async_trait]
impl<C: ResourceClient + 'static> HierarchyDecoder for EptDecoder<C> {
    fn format(&self) -> Format {
        Format::Ept
    }

    fn root_address(&self) -> NodeAddress {
        NodeAddress::Ept
    }

    fn hierarchy_url(&self, request: &NodeRequest) -> String {
        format!("{}/ept-hierarchy/{}.json", self.base_url, request.key)
    }

    fn content_url(&self, request: &NodeRequest) -> String {
        format!("{}/ept-data/{}.{}", self.base_url, request.key, self.extension)
    }

    async fn fetch_hierarchy(&self, request: &NodeRequest) -> Result<Vec<u8>, ResourceError> {
        self.client
            .get(&self.hierarchy_url(request), self.options.headers())
            .await
    }

    async fn fetch_content(&self, request: &NodeRequest) -> Result<Vec<u8>, ResourceError> {
        self.client
            .get(&self.content_url(request), self.options.headers())
            .await
    }

    fn expand(
        &self,
        octree: &mut Octree,
        node: NodeId,
        buf: &[u8],
        elevation: &ElevationRange,
    ) -> Result<Expansion, ReadHierarchyError> {
        let counts = parse_counts(buf)?;
        let key = octree
            .node(node)
            .map(|n| n.key)
            .ok_or(ReadHierarchyError::NodeNotFound)?;
        let _span = span!(Level::DEBUG, "ept_hierarchy", %key).entered();

        let own = match counts.get(&key) {
            Some(count) => (*count).max(0) as u64,
            None => {
                warn!("EPT hierarchy of {} does not list the node itself", key);
                0
            }
        };
        if let Some(n) = octree.node_mut(node) {
            n.num_points = Some(own);
        }

        let created = expand_by_key(octree, node, elevation, |child| {
            let count = *counts.get(&child)?;
            let num_points = (count >= 0).then_some(count as u64);
            Some((num_points, NodeAddress::Ept))
        });

        trace!("{} EPT nodes linked below {}", created.len(), key);
        Ok(Expansion {
            created,
            truncated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::memory::MemoryClient;
    use glam::DVec3;
    use serde_json::json;

    fn metadata() -> EptMetadata {
        serde_json::from_value(json!({
            "bounds": [0.0, 0.0, 0.0, 64.0, 64.0, 64.0],
            "boundsConforming": [2.0, 3.0, 10.0, 60.0, 62.0, 20.0],
            "dataType": "laszip",
            "hierarchyType": "json",
            "points": 100,
            "span": 128,
            "schema": []
        }))
        .unwrap()
    }

    fn decoder() -> EptDecoder<MemoryClient> {
        EptDecoder::new("mem://ept", &metadata(), MemoryClient::new(), NetworkOptions::default())
            .unwrap()
    }

    fn tree() -> (Octree, NodeId) {
        let mut octree = Octree::new();
        let root = octree.insert_root(
            Default::default(),
            Aabb::from_array(metadata().bounds),
            &metadata().elevation(),
            None,
            NodeAddress::Ept,
        );
        (octree, root)
    }

    #[test]
    fn metadata_derives_spacing_and_extension() {
        let metadata = metadata();
        assert_eq!(metadata.spacing(), 0.5);
        assert_eq!(metadata.elevation(), ElevationRange::new(10.0, 20.0));
        assert_eq!(metadata.extension().unwrap(), "laz");
    }

    #[test]
    fn unsupported_data_type_fails_at_construction() {
        let mut metadata = metadata();
        metadata.data_type = "draco".to_string();
        assert!(matches!(
            EptDecoder::new("mem://ept", &metadata, MemoryClient::new(), NetworkOptions::default()),
            Err(LoadSourceError::UnsupportedFormat(_))
        ));

        let mut metadata = self::metadata();
        metadata.hierarchy_type = "gzip".to_string();
        assert!(EptDecoder::new("mem://ept", &metadata, MemoryClient::new(), NetworkOptions::default()).is_err());
    }

    #[test]
    fn urls_use_voxel_keys() {
        let decoder = decoder();
        let request = NodeRequest {
            key: VoxelKey::new(2, 1, 3, 0),
            address: NodeAddress::Ept,
        };
        assert_eq!(decoder.hierarchy_url(&request), "mem://ept/ept-hierarchy/2-1-3-0.json");
        assert_eq!(decoder.content_url(&request), "mem://ept/ept-data/2-1-3-0.laz");
    }

    #[test]
    fn only_listed_children_are_created() {
        let (mut octree, root) = tree();
        let buf = json!({ "0-0-0-0": 10, "1-0-0-0": 3 }).to_string();

        let expansion = decoder()
            .expand(&mut octree, root, buf.as_bytes(), &metadata().elevation())
            .unwrap();

        assert_eq!(expansion.created.len(), 1);
        let root_node = octree.node(root).unwrap();
        assert_eq!(root_node.num_points, Some(10));
        let child = octree.node(expansion.created[0]).unwrap();
        assert_eq!(child.key, VoxelKey::new(1, 0, 0, 0));
        assert_eq!(child.num_points, Some(3));
        assert_eq!(root_node.children[0], Some(expansion.created[0]));
        assert!(octree.find(Default::default(), VoxelKey::new(1, 1, 0, 0)).is_none());
    }

    #[test]
    fn expands_multiple_levels_and_stops_at_unloaded_nodes() {
        let (mut octree, root) = tree();
        let buf = json!({
            "0-0-0-0": 10,
            "1-1-0-0": 5,
            "2-2-1-0": 2,
            "1-0-1-1": -1,
            "2-0-2-2": 7
        })
        .to_string();

        let expansion = decoder()
            .expand(&mut octree, root, buf.as_bytes(), &metadata().elevation())
            .unwrap();

        assert_eq!(expansion.created.len(), 3);
        let deep = octree.find(Default::default(), VoxelKey::new(2, 2, 1, 0)).unwrap();
        let deep = octree.node(deep).unwrap();
        assert_eq!(deep.num_points, Some(2));
        assert_eq!(deep.bounds.voxel.min, DVec3::new(32.0, 16.0, 0.0));

        let pending = octree.find(Default::default(), VoxelKey::new(1, 0, 1, 1)).unwrap();
        assert_eq!(octree.node(pending).unwrap().num_points, None);
        // below an unloaded node nothing is materialised, even if the document lists it
        assert!(octree.find(Default::default(), VoxelKey::new(2, 0, 2, 2)).is_none());
    }

    #[test]
    fn malformed_document_is_an_error() {
        let (mut octree, root) = tree();
        let result = decoder().expand(&mut octree, root, b"[1, 2", &ElevationRange::UNBOUNDED);
        assert!(matches!(result, Err(ReadHierarchyError::Malformed(_))));
        assert_eq!(octree.node(root).unwrap().num_points, None);
    }

    #[tokio::test]
    async fn opens_from_dataset_directory() {
        let client = MemoryClient::new();
        client.insert_json(
            "mem://autzen/ept.json",
            &json!({
                "bounds": [0, 0, 0, 8, 8, 8],
                "boundsConforming": [0, 0, 1, 8, 8, 3],
                "dataType": "binary",
                "span": 4
            }),
        );

        let source = EptDecoder::open("mem://autzen/ept.json", client.clone(), NetworkOptions::default())
            .await
            .unwrap();
        assert_eq!(source.decoder.format(), Format::Ept);
        assert_eq!(source.spacing, 2.0);
        assert_eq!(source.elevation, ElevationRange::new(1.0, 3.0));

        let missing = EptDecoder::open("mem://nowhere", client, NetworkOptions::default()).await;
        assert!(matches!(missing, Err(LoadSourceError::LoadMetadata(_))));
    }
}
