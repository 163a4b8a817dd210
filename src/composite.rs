//! Virtual point clouds (`.vpc`): a STAC feature collection listing EPT or COPC tiles that
//! together form one dataset. Tiles are only opened once the traversal reaches them.

use crate::hierarchy::copc::CopcDecoder;
use crate::hierarchy::ept::EptDecoder;
use crate::hierarchy::{Format, NodeRequest};
use crate::octree::aabb::{Aabb, ElevationRange};
use crate::octree::key::VoxelKey;
use crate::resource::{parent_url, resolve_url, NetworkOptions, ResourceClient};
use crate::source::{LoadSourceError, OpenedSource};
use serde::Deserialize;
use tracing::{debug, span, Instrument, Level};

#[derive(Deserialize, Clone, Debug)]
pub struct VpcIndex {
    pub features: Vec<VpcFeature>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct VpcFeature {
    pub assets: VpcAssets,
    pub properties: VpcProperties,
}

#[derive(Deserialize, Clone, Debug)]
pub struct VpcAssets {
    pub data: VpcAsset,
}

#[derive(Deserialize, Clone, Debug)]
pub struct VpcAsset {
    pub href: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct VpcProperties {
    #[serde(rename = "proj:bbox")]
    pub bbox: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TileDescriptor {
    pub url: String,
    pub format: Format,
    /// Extent of the tile's points, as announced by the index.
    pub bounds: Aabb,
}

#[derive(Clone, Debug)]
pub struct CompositeSource {
    pub url: String,
    pub tiles: Vec<TileDescriptor>,
    /// Union of the tiles' vertical extents.
    pub elevation: ElevationRange,
}

impl CompositeSource {
    pub async fn open<C: ResourceClient>(
        url: &str,
        client: &C,
        options: &NetworkOptions,
    ) -> Result<Self, LoadSourceError> {
        let index: VpcIndex = client
            .get_json(url, options.headers())
            .await
            .map_err(LoadSourceError::LoadMetadata)?;
        Self::from_index(url, index)
    }

    pub fn from_index(url: &str, index: VpcIndex) -> Result<Self, LoadSourceError> {
        if index.features.is_empty() {
            return Err(LoadSourceError::InvalidMetadata(format!(
                "{} does not list any tile",
                url
            )));
        }

        let base = parent_url(url);
        let mut elevation = ElevationRange::new(f64::INFINITY, f64::NEG_INFINITY);
        let mut tiles = Vec::with_capacity(index.features.len());

        for feature in index.features {
            let bbox: [f64; 6] = feature.properties.bbox.as_slice().try_into().map_err(|_| {
                LoadSourceError::InvalidMetadata(format!(
                    "proj:bbox of {} has {} values, expected 6",
                    feature.assets.data.href,
                    feature.properties.bbox.len()
                ))
            })?;
            let bounds = Aabb::from_array(bbox);
            elevation = elevation.union(&ElevationRange::new(bounds.min.z, bounds.max.z));

            let tile_url = resolve_url(base, &feature.assets.data.href);
            let format = if tile_url.contains(".copc") {
                Format::Copc
            } else {
                Format::Ept
            };
            tiles.push(TileDescriptor {
                url: tile_url,
                format,
                bounds,
            });
        }

        Ok(Self {
            url: url.to_string(),
            tiles,
            elevation,
        })
    }
}

/// A tile whose metadata and root hierarchy have been read.
#[derive(Debug)]
pub struct TileBootstrap {
    pub source: OpenedSource,
    pub hierarchy: Vec<u8>,
}

/// Opens one tile and fetches the hierarchy of its root.
pub async fn bootstrap_tile<C>(
    tile: TileDescriptor,
    client: C,
    options: NetworkOptions,
) -> Result<TileBootstrap, LoadSourceError>
where
    C: ResourceClient + 'static,
{
    let span = span!(Level::DEBUG, "bootstrap_tile", url = %tile.url);
    open_tile(tile, client, options).instrument(span).await
}

async fn open_tile<C>(
    tile: TileDescriptor,
    client: C,
    options: NetworkOptions,
) -> Result<TileBootstrap, LoadSourceError>
where
    C: ResourceClient + 'static,
{
    let source = match tile.format {
        Format::Copc => CopcDecoder::open(&tile.url, client, options).await?,
        Format::Ept => EptDecoder::open(&tile.url, client, options).await?,
        Format::Potree => {
            return Err(LoadSourceError::UnsupportedFormat(format!(
                "Potree tile {} in a composite index",
                tile.url
            )))
        }
    };

    let request = NodeRequest {
        key: VoxelKey::ROOT,
        address: source.decoder.root_address(),
    };
    let hierarchy = source.decoder.fetch_hierarchy(&request).await?;
    debug!("tile ready, root hierarchy is {} bytes", hierarchy.len());
    Ok(TileBootstrap { source, hierarchy })
}
