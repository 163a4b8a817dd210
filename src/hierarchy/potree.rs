//! Potree 1.x (`cloud.js`): `.hrc` files holding a breadth-first run of 5 byte records.

use crate::hierarchy::{Expansion, Format, HierarchyDecoder, NodeRequest, ReadHierarchyError};
use crate::octree::aabb::{Aabb, ElevationRange};
use crate::octree::node::NodeAddress;
use crate::octree::{NodeId, Octree};
use crate::resource::{parent_url, NetworkOptions, ResourceClient, ResourceError};
use crate::source::{LoadSourceError, OpenedSource};
use async_trait::async_trait;
use binrw::{binrw, BinReaderExt};
use glam::DVec3;
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{span, trace, warn, Level};

const RECORD_SIZE: usize = 5;

#[binrw]
#[derive(Debug, Clone, Copy)]
#[brw(little)]
pub struct HierarchyRecord {
    pub child_mask: u8,
    pub num_points: u32,
}

#[derive(Deserialize, Clone, Copy, Debug)]
pub struct PotreeBoundingBox {
    pub lx: f64,
    pub ly: f64,
    pub lz: f64,
    pub ux: f64,
    pub uy: f64,
    pub uz: f64,
}

impl From<PotreeBoundingBox> for Aabb {
    fn from(b: PotreeBoundingBox) -> Self {
        Aabb::new(DVec3::new(b.lx, b.ly, b.lz), DVec3::new(b.ux, b.uy, b.uz))
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum PointAttributes {
    /// `"LAS"` or `"LAZ"`.
    Encoded(String),
    /// Attribute names of the uncompressed binary layout.
    Binary(Vec<String>),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PotreeMetadata {
    pub version: String,
    pub octree_dir: String,
    #[serde(default)]
    pub points: u64,
    pub bounding_box: PotreeBoundingBox,
    pub tight_bounding_box: Option<PotreeBoundingBox>,
    pub point_attributes: PointAttributes,
    pub spacing: f64,
    pub hierarchy_step_size: usize,
}

impl PotreeMetadata {
    pub fn extension(&self) -> &'static str {
        match &self.point_attributes {
            PointAttributes::Encoded(encoding) if encoding.eq_ignore_ascii_case("laz") => "laz",
            PointAttributes::Encoded(encoding) if encoding.eq_ignore_ascii_case("las") => "las",
            _ => "bin",
        }
    }

    pub fn elevation(&self) -> ElevationRange {
        let b = self.tight_bounding_box.unwrap_or(self.bounding_box);
        ElevationRange::new(b.lz, b.uz)
    }
}

pub struct PotreeDecoder<C> {
    /// Octree directory, parent of the `r` folder.
    base_url: String,
    step_size: usize,
    extension: &'static str,
    client: C,
    options: NetworkOptions,
}

impl<C: ResourceClient + 'static> PotreeDecoder<C> {
    pub fn new(
        cloud_url: &str,
        metadata: &PotreeMetadata,
        client: C,
        options: NetworkOptions,
    ) -> Result<Self, LoadSourceError> {
        if metadata.hierarchy_step_size == 0 {
            return Err(LoadSourceError::InvalidMetadata(
                "Potree hierarchyStepSize is 0".to_string(),
            ));
        }

        Ok(Self {
            base_url: format!(
                "{}/{}",
                parent_url(cloud_url),
                metadata.octree_dir.trim_matches('/')
            ),
            step_size: metadata.hierarchy_step_size,
            extension: metadata.extension(),
            client,
            options,
        })
    }

    /// Reads `cloud.js` at `url`.
    pub async fn open(
        url: &str,
        client: C,
        options: NetworkOptions,
    ) -> Result<OpenedSource, LoadSourceError> {
        let metadata: PotreeMetadata = client
            .get_json(url, options.headers())
            .await
            .map_err(LoadSourceError::LoadMetadata)?;

        if metadata.version.starts_with('2') {
            return Err(LoadSourceError::UnsupportedFormat(format!(
                "Potree {} in {}",
                metadata.version, url
            )));
        }

        let decoder = Self::new(url, &metadata, client, options)?;
        Ok(OpenedSource {
            decoder: Arc::new(decoder),
            bounds: metadata.bounding_box.into(),
            spacing: metadata.spacing,
            elevation: metadata.elevation(),
        })
    }

    /// Folder of a child: a new sub folder every `step_size` levels, the parent's otherwise.
    fn child_folder(&self, parent_folder: &str, child_name: &str) -> String {
        let digits = child_name.len() - 1;
        if digits % self.step_size == 0 {
            format!(
                "{}/{}",
                parent_folder,
                &child_name[child_name.len() - self.step_size..]
            )
        } else {
            parent_folder.to_string()
        }
    }

    fn url(&self, request: &NodeRequest, extension: &str) -> String {
        match &request.address {
            NodeAddress::Potree { name, folder, .. } => {
                format!("{}/{}/{}.{}", self.base_url, folder, name, extension)
            }
            _ => format!("{}/r/r.{}", self.base_url, extension),
        }
    }
}

fn read_record(cursor: &mut Cursor<&[u8]>) -> Result<HierarchyRecord, ReadHierarchyError> {
    Ok(cursor.read_le()?)
}

#[async_trait]
impl<C: ResourceClient + 'static> HierarchyDecoder for PotreeDecoder<C> {
    fn format(&self) -> Format {
        Format::Potree
    }

    fn root_address(&self) -> NodeAddress {
        NodeAddress::Potree {
            name: "r".to_string(),
            folder: "r".to_string(),
            child_mask: 0,
        }
    }

    fn hierarchy_url(&self, request: &NodeRequest) -> String {
        self.url(request, "hrc")
    }

    fn content_url(&self, request: &NodeRequest) -> String {
        self.url(request, self.extension)
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
        let key = octree
            .node(node)
            .map(|n| n.key)
            .ok_or(ReadHierarchyError::NodeNotFound)?;
        let _span = span!(Level::DEBUG, "potree_hierarchy", %key).entered();

        if buf.len() < RECORD_SIZE {
            return Err(ReadHierarchyError::Malformed(format!(
                "hrc of {} is {} bytes long",
                key,
                buf.len()
            )));
        }

        let mut cursor = Cursor::new(buf);
        let own = read_record(&mut cursor)?;
        let node_ref = octree.node_mut(node).ok_or(ReadHierarchyError::NodeNotFound)?;
        node_ref.num_points = Some(own.num_points as u64);
        let (root_name, root_folder) = match &mut node_ref.address {
            NodeAddress::Potree {
                name,
                folder,
                child_mask,
            } => {
                *child_mask = own.child_mask;
                (name.clone(), folder.clone())
            }
            other => {
                return Err(ReadHierarchyError::Malformed(format!(
                    "node {} has a {:?} address",
                    key, other
                )))
            }
        };

        let mut created = Vec::new();
        let mut truncated = false;
        let mut queue = VecDeque::from([(node, own.child_mask, root_name, root_folder)]);

        'bfs: while let Some((current, mask, name, folder)) = queue.pop_front() {
            if cursor.position() as usize >= buf.len() {
                break;
            }
            for octant in 0..8u8 {
                if mask & (1 << octant) == 0 {
                    continue;
                }
                let offset = cursor.position() as usize;
                if offset + RECORD_SIZE > buf.len() {
                    warn!(
                        "hrc of {} truncated at byte {} of {}, stopping below {}",
                        key,
                        offset,
                        buf.len(),
                        name
                    );
                    truncated = true;
                    break 'bfs;
                }

                let record = read_record(&mut cursor)?;
                let child_name = format!("{}{}", name, octant);
                let child_folder = self.child_folder(&folder, &child_name);
                let address = NodeAddress::Potree {
                    name: child_name.clone(),
                    folder: child_folder.clone(),
                    child_mask: record.child_mask,
                };
                let child = octree.attach(
                    current,
                    octant,
                    Some(record.num_points as u64),
                    address,
                    elevation,
                );
                created.push(child);
                queue.push_back((child, record.child_mask, child_name, child_folder));
            }
        }

        // nodes announcing children the buffer did not describe need their own hrc
        for id in std::iter::once(node).chain(created.iter().copied()) {
            if let Some(n) = octree.node_mut(id) {
                let announces = matches!(n.address, NodeAddress::Potree { child_mask, .. } if child_mask != 0);
                if announces && !n.has_children() {
                    n.num_points = None;
                    n.hierarchy = Default::default();
                }
            }
        }

        trace!("{} Potree nodes linked below {}", created.len(), key);
        Ok(Expansion { created, truncated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::key::VoxelKey;
    use crate::octree::node::SourceId;
    use crate::resource::memory::MemoryClient;
    use serde_json::json;

    fn metadata(step: usize) -> PotreeMetadata {
        serde_json::from_value(json!({
            "version": "1.8",
            "octreeDir": "data",
            "points": 1000,
            "boundingBox": { "lx": 0, "ly": 0, "lz": 0, "ux": 16, "uy": 16, "uz": 16 },
            "tightBoundingBox": { "lx": 1, "ly": 1, "lz": 2, "ux": 15, "uy": 14, "uz": 6 },
            "pointAttributes": "LAZ",
            "spacing": 0.5,
            "scale": 0.001,
            "hierarchyStepSize": step
        }))
        .unwrap()
    }

    fn decoder(step: usize) -> PotreeDecoder<MemoryClient> {
        PotreeDecoder::new(
            "mem://lion/cloud.js",
            &metadata(step),
            MemoryClient::new(),
            NetworkOptions::default(),
        )
        .unwrap()
    }

    fn tree(decoder: &PotreeDecoder<MemoryClient>) -> (Octree, NodeId) {
        let mut octree = Octree::new();
        let root = octree.insert_root(
            SourceId(0),
            metadata(5).bounding_box.into(),
            &ElevationRange::UNBOUNDED,
            None,
            decoder.root_address(),
        );
        (octree, root)
    }

    fn record(mask: u8, count: u32) -> Vec<u8> {
        let mut bytes = vec![mask];
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes
    }

    fn address(octree: &Octree, id: NodeId) -> (String, String, u8) {
        match &octree.node(id).unwrap().address {
            NodeAddress::Potree {
                name,
                folder,
                child_mask,
            } => (name.clone(), folder.clone(), *child_mask),
            other => panic!("unexpected address {:?}", other),
        }
    }

    #[test]
    fn metadata_values() {
        let metadata = metadata(5);
        assert_eq!(metadata.extension(), "laz");
        assert_eq!(metadata.elevation(), ElevationRange::new(2.0, 6.0));

        let binary: PotreeMetadata = serde_json::from_value(json!({
            "version": "1.7",
            "octreeDir": "data",
            "boundingBox": { "lx": 0, "ly": 0, "lz": 0, "ux": 1, "uy": 1, "uz": 1 },
            "pointAttributes": ["POSITION_CARTESIAN", "COLOR_PACKED"],
            "spacing": 1.0,
            "hierarchyStepSize": 4
        }))
        .unwrap();
        assert_eq!(binary.extension(), "bin");
        assert_eq!(binary.elevation(), ElevationRange::new(0.0, 1.0));
    }

    #[test]
    fn root_urls() {
        let decoder = decoder(5);
        let request = NodeRequest {
            key: VoxelKey::ROOT,
            address: decoder.root_address(),
        };
        assert_eq!(decoder.hierarchy_url(&request), "mem://lion/data/r/r.hrc");
        assert_eq!(decoder.content_url(&request), "mem://lion/data/r/r.laz");
    }

    #[test]
    fn bitfield_selects_children() {
        let decoder = decoder(5);
        let (mut octree, root) = tree(&decoder);
        let buf = [record(0b0000_0011, 40), record(0, 5), record(0, 7)].concat();

        let expansion = decoder
            .expand(&mut octree, root, &buf, &ElevationRange::UNBOUNDED)
            .unwrap();

        assert!(!expansion.truncated);
        assert_eq!(expansion.created.len(), 2);
        let root_node = octree.node(root).unwrap();
        assert_eq!(root_node.num_points, Some(40));
        assert!(root_node.children[0].is_some());
        assert!(root_node.children[1].is_some());
        assert!(root_node.children[2..].iter().all(Option::is_none));

        let first = octree.node(expansion.created[0]).unwrap();
        assert_eq!(first.key, VoxelKey::new(1, 0, 0, 0));
        assert_eq!(first.num_points, Some(5));
        let second = octree.node(expansion.created[1]).unwrap();
        assert_eq!(second.key, VoxelKey::new(1, 0, 0, 1));
        assert_eq!(second.num_points, Some(7));
        assert_eq!(address(&octree, expansion.created[1]).0, "r1");
    }

    #[test]
    fn truncated_buffer_keeps_discovered_nodes() {
        let decoder = decoder(5);
        let (mut octree, root) = tree(&decoder);
        let mut buf = [record(0b0000_0111, 40), record(0, 5)].concat();
        buf.extend_from_slice(&[0, 1, 2]);

        let expansion = decoder
            .expand(&mut octree, root, &buf, &ElevationRange::UNBOUNDED)
            .unwrap();

        assert!(expansion.truncated);
        assert_eq!(expansion.created.len(), 1);
        assert_eq!(octree.node(root).unwrap().num_points, Some(40));
        assert_eq!(octree.node(expansion.created[0]).unwrap().num_points, Some(5));
    }

    #[test]
    fn breadth_first_order_and_pending_leaves() {
        let decoder = decoder(5);
        let (mut octree, root) = tree(&decoder);
        // r has children 0 and 2; r0 has child 3; r2 announces child 1 which is not in this file
        let buf = [
            record(0b0000_0101, 100),
            record(0b0000_1000, 30),
            record(0b0000_0010, 20),
            record(0, 4),
        ]
        .concat();

        let expansion = decoder
            .expand(&mut octree, root, &buf, &ElevationRange::UNBOUNDED)
            .unwrap();

        let names: Vec<String> = expansion
            .created
            .iter()
            .map(|id| address(&octree, *id).0)
            .collect();
        assert_eq!(names, vec!["r0", "r2", "r03"]);

        let r2 = octree.node(expansion.created[1]).unwrap();
        assert_eq!(r2.num_points, None);
        assert!(r2.hierarchy.is_idle());
        assert_eq!(octree.node(expansion.created[2]).unwrap().num_points, Some(4));
    }

    #[test]
    fn step_size_moves_children_to_sub_folders() {
        let decoder = decoder(2);
        let (mut octree, root) = tree(&decoder);
        let buf = [record(0b1000_0000, 9), record(0b0100_0000, 8), record(0b0010_0000, 7)].concat();

        let expansion = decoder
            .expand(&mut octree, root, &buf, &ElevationRange::UNBOUNDED)
            .unwrap();

        let (name, folder, _) = address(&octree, expansion.created[0]);
        assert_eq!((name.as_str(), folder.as_str()), ("r7", "r"));
        let (name, folder, mask) = address(&octree, expansion.created[1]);
        assert_eq!((name.as_str(), folder.as_str(), mask), ("r76", "r/76", 0b0010_0000));

        // r76 announces r765 but its records are in r/76/r76.hrc
        let r76 = expansion.created[1];
        assert_eq!(octree.node(r76).unwrap().num_points, None);
        let request = NodeRequest {
            key: octree.node(r76).unwrap().key,
            address: octree.node(r76).unwrap().address.clone(),
        };
        assert_eq!(decoder.hierarchy_url(&request), "mem://lion/data/r/76/r76.hrc");

        let nested = [record(0b0010_0000, 8), record(0, 3)].concat();
        let expansion = decoder
            .expand(&mut octree, r76, &nested, &ElevationRange::UNBOUNDED)
            .unwrap();
        let (name, folder, _) = address(&octree, expansion.created[0]);
        assert_eq!((name.as_str(), folder.as_str()), ("r765", "r/76"));
        assert_eq!(octree.node(r76).unwrap().num_points, Some(8));
    }

    #[test]
    fn short_buffer_is_malformed() {
        let decoder = decoder(5);
        let (mut octree, root) = tree(&decoder);
        let result = decoder.expand(&mut octree, root, &[1, 2], &ElevationRange::UNBOUNDED);
        assert!(matches!(result, Err(ReadHierarchyError::Malformed(_))));
        assert_eq!(octree.node(root).unwrap().num_points, None);
    }

    #[tokio::test]
    async fn open_reads_cloud_js() {
        let client = MemoryClient::new();
        client.insert_json(
            "mem://lion/cloud.js",
            &json!({
                "version": "1.8",
                "octreeDir": "data",
                "boundingBox": { "lx": 0, "ly": 0, "lz": 0, "ux": 8, "uy": 8, "uz": 8 },
                "pointAttributes": "LAZ",
                "spacing": 0.25,
                "hierarchyStepSize": 5
            }),
        );
        let source = PotreeDecoder::open("mem://lion/cloud.js", client, NetworkOptions::default())
            .await
            .unwrap();
        assert_eq!(source.decoder.format(), Format::Potree);
        assert_eq!(source.spacing, 0.25);
        assert_eq!(source.bounds.max, DVec3::splat(8.0));
    }
}
