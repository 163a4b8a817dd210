//! Cloud Optimized Point Cloud: one LAZ file whose hierarchy is a set of 32 byte entry pages.
//! An entry either points at compressed point data or, with a point count of `-1`, at another
//! page, so the hierarchy is read incrementally with ranged requests.

use crate::hierarchy::{
    expand_by_key, Expansion, Format, HierarchyDecoder, NodeRequest, ReadHierarchyError,
};
use crate::octree::aabb::{Aabb, ElevationRange};
use crate::octree::key::VoxelKey;
use crate::octree::node::{Chunk, NodeAddress};
use crate::octree::{NodeId, Octree};
use crate::resource::{NetworkOptions, ResourceClient, ResourceError};
use crate::source::{LoadSourceError, OpenedSource};
use async_trait::async_trait;
use binrw::{binrw, BinReaderExt};
use glam::DVec3;
use std::collections::HashMap;
use std::io::{Cursor, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, span, trace, warn, Level};

const LAS_HEADER_SIZE: u64 = 375;
const VLR_HEADER_SIZE: u64 = 54;
const COPC_INFO_SIZE: u64 = 160;
/// Header, first VLR header and the COPC info payload.
const PREAMBLE_SIZE: u64 = LAS_HEADER_SIZE + VLR_HEADER_SIZE + COPC_INFO_SIZE;
const ENTRY_SIZE: usize = 32;

/// The few LAS 1.4 header fields needed here.
#[binrw]
#[derive(Debug, Clone)]
#[brw(little)]
pub struct LasHeader {
    pub signature: [u8; 4],
    #[brw(pad_before = 20)]
    pub version_major: u8,
    pub version_minor: u8,
    #[brw(pad_before = 153)]
    pub max_x: f64,
    pub min_x: f64,
    pub max_y: f64,
    pub min_y: f64,
    pub max_z: f64,
    pub min_z: f64,
}

#[binrw]
#[derive(Debug, Clone)]
#[brw(little)]
pub struct VlrHeader {
    pub reserved: u16,
    pub user_id: [u8; 16],
    pub record_id: u16,
    pub record_length: u16,
    pub description: [u8; 32],
}

#[binrw]
#[derive(Debug, Clone, Default)]
#[brw(little)]
pub struct CopcInfo {
    pub center_x: f64,
    pub center_y: f64,
    pub center_z: f64,
    pub halfsize: f64,
    pub spacing: f64,
    pub root_hier_offset: u64,
    pub root_hier_size: u64,
    pub gpstime_minimum: f64,
    pub gpstime_maximum: f64,
    pub reserved: [u64; 11],
}

#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct HierarchyEntry {
    pub depth: i32,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub offset: u64,
    pub byte_size: i32,
    /// `-1` when `offset`/`byte_size` locate a child page rather than point data.
    pub point_count: i32,
}

impl HierarchyEntry {
    pub fn key(&self) -> Option<VoxelKey> {
        Some(VoxelKey::new(
            u32::try_from(self.depth).ok()?,
            u32::try_from(self.x).ok()?,
            u32::try_from(self.y).ok()?,
            u32::try_from(self.z).ok()?,
        ))
    }

    pub fn is_page(&self) -> bool {
        self.point_count == -1
    }

    fn chunk(&self) -> Option<Chunk> {
        (self.byte_size > 0).then_some(Chunk {
            offset: self.offset,
            length: self.byte_size as u64,
        })
    }

    fn address(&self) -> NodeAddress {
        if self.is_page() {
            NodeAddress::Copc {
                page: self.chunk(),
                data: None,
            }
        } else {
            NodeAddress::Copc {
                page: None,
                data: self.chunk(),
            }
        }
    }
}

/// Validates the preamble of a COPC file and extracts its header and info VLR.
pub fn read_preamble(buf: &[u8]) -> Result<(LasHeader, CopcInfo), LoadSourceError> {
    if buf.len() < PREAMBLE_SIZE as usize {
        return Err(LoadSourceError::InvalidMetadata(format!(
            "COPC preamble is {} bytes long",
            buf.len()
        )));
    }

    let mut cursor = Cursor::new(buf);
    let header: LasHeader = cursor.read_le()?;
    if &header.signature != b"LASF" {
        return Err(LoadSourceError::UnsupportedFormat(
            "missing LASF signature".to_string(),
        ));
    }
    if (header.version_major, header.version_minor) != (1, 4) {
        return Err(LoadSourceError::UnsupportedFormat(format!(
            "LAS {}.{}, COPC requires 1.4",
            header.version_major, header.version_minor
        )));
    }

    cursor
        .seek(SeekFrom::Start(LAS_HEADER_SIZE))
        .map_err(|e| LoadSourceError::InvalidMetadata(e.to_string()))?;
    let vlr: VlrHeader = cursor.read_le()?;
    if !vlr.user_id.starts_with(b"copc") || vlr.record_id != 1 {
        return Err(LoadSourceError::UnsupportedFormat(
            "first VLR is not the COPC info record".to_string(),
        ));
    }

    let info: CopcInfo = cursor.read_le()?;
    if info.halfsize <= 0.0 || info.spacing <= 0.0 {
        return Err(LoadSourceError::InvalidMetadata(format!(
            "COPC info has halfsize {} and spacing {}",
            info.halfsize, info.spacing
        )));
    }
    Ok((header, info))
}

/// Reads every whole entry of a page. The flag is set when trailing bytes were ignored.
fn read_page(buf: &[u8]) -> Result<(HashMap<VoxelKey, HierarchyEntry>, bool), ReadHierarchyError> {
    let count = buf.len() / ENTRY_SIZE;
    let mut cursor = Cursor::new(buf);
    let mut entries = HashMap::with_capacity(count);
    for _ in 0..count {
        let entry: HierarchyEntry = cursor.read_le()?;
        match entry.key() {
            Some(key) => {
                entries.insert(key, entry);
            }
            None => warn!("skipping COPC entry with negative key {:?}", entry),
        }
    }
    Ok((entries, buf.len() % ENTRY_SIZE != 0))
}

pub struct CopcDecoder<C> {
    url: String,
    root_page: Chunk,
    client: C,
    options: NetworkOptions,
}

impl<C: ResourceClient + 'static> CopcDecoder<C> {
    pub async fn open(
        url: &str,
        client: C,
        options: NetworkOptions,
    ) -> Result<OpenedSource, LoadSourceError> {
        let preamble = client
            .get_range(url, 0, PREAMBLE_SIZE as usize, options.headers())
            .await
            .map_err(LoadSourceError::LoadMetadata)?;
        let (header, info) = read_preamble(&preamble)?;
        debug!(
            "COPC {}: halfsize {}, spacing {}, root page {}+{}",
            url, info.halfsize, info.spacing, info.root_hier_offset, info.root_hier_size
        );

        let center = DVec3::new(info.center_x, info.center_y, info.center_z);
        let decoder = Self {
            url: url.to_string(),
            root_page: Chunk {
                offset: info.root_hier_offset,
                length: info.root_hier_size,
            },
            client,
            options,
        };

        Ok(OpenedSource {
            decoder: Arc::new(decoder),
            bounds: Aabb::new(center - info.halfsize, center + info.halfsize),
            spacing: info.spacing,
            elevation: ElevationRange::new(header.min_z, header.max_z),
        })
    }

    async fn fetch_chunk(&self, chunk: Option<Chunk>, what: &str) -> Result<Vec<u8>, ResourceError> {
        let chunk = chunk.ok_or_else(|| ResourceError::Other(format!("node has no {}", what)))?;
        self.client
            .get_range(
                &self.url,
                chunk.offset,
                chunk.length as usize,
                self.options.headers(),
            )
            .await
    }
}

#[async_trait]
impl<C: ResourceClient + 'static> HierarchyDecoder for CopcDecoder<C> {
    fn format(&self) -> Format {
        Format::Copc
    }

    fn root_address(&self) -> NodeAddress {
        NodeAddress::Copc {
            page: Some(self.root_page),
            data: None,
        }
    }

    fn hierarchy_url(&self, _request: &NodeRequest) -> String {
        self.url.clone()
    }

    fn content_url(&self, _request: &NodeRequest) -> String {
        self.url.clone()
    }

    async fn fetch_hierarchy(&self, request: &NodeRequest) -> Result<Vec<u8>, ResourceError> {
        let page = match &request.address {
            NodeAddress::Copc { page, .. } => *page,
            _ => None,
        };
        self.fetch_chunk(page, "hierarchy page").await
    }

    async fn fetch_content(&self, request: &NodeRequest) -> Result<Vec<u8>, ResourceError> {
        let data = match &request.address {
            NodeAddress::Copc { data, .. } => *data,
            _ => None,
        };
        self.fetch_chunk(data, "point data").await
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
        let _span = span!(Level::DEBUG, "copc_hierarchy", %key).entered();

        let (entries, truncated) = read_page(buf)?;
        if truncated {
            warn!(
                "COPC page of {} has {} trailing bytes",
                key,
                buf.len() % ENTRY_SIZE
            );
        }

        let (num_points, address) = match entries.get(&key) {
            Some(entry) if !entry.is_page() => (entry.point_count.max(0) as u64, entry.address()),
            _ => {
                warn!("COPC page of {} does not describe the node itself", key);
                (0, NodeAddress::Copc { page: None, data: None })
            }
        };
        if let Some(n) = octree.node_mut(node) {
            n.num_points = Some(num_points);
            n.address = address;
        }

        let created = expand_by_key(octree, node, elevation, |child| {
            let entry = entries.get(&child)?;
            let num_points = (!entry.is_page()).then(|| entry.point_count.max(0) as u64);
            Some((num_points, entry.address()))
        });

        trace!("{} COPC nodes linked below {}", created.len(), key);
        Ok(Expansion { created, truncated })
    }
}
