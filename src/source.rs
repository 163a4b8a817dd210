//! Dataset format detection and opening.

use crate::hierarchy::copc::CopcDecoder;
use crate::hierarchy::ept::EptDecoder;
use crate::hierarchy::potree::PotreeDecoder;
use crate::hierarchy::{Format, HierarchyDecoder, ReadHierarchyError};
use crate::octree::aabb::{Aabb, ElevationRange};
use crate::resource::{NetworkOptions, ResourceClient, ResourceError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum LoadSourceError {
    #[error("Error loading metadata: {0}")]
    LoadMetadata(ResourceError),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Invalid binary data: {0}")]
    InvalidBinaryData(#[from] binrw::error::Error),

    #[error("Error loading hierarchy: {0}")]
    Hierarchy(#[from] ReadHierarchyError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
}

/// Kind of dataset behind a url.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Single(Format),
    /// Virtual point cloud index referencing several EPT/COPC tiles.
    Composite,
}

/// Detects the dataset kind from its url, before anything is fetched.
pub fn detect_format(url: &str) -> Result<SourceKind, LoadSourceError> {
    let path = url.split(['?', '#']).next().unwrap_or(url).trim_end_matches('/');
    let file = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();

    if file.ends_with(".copc.laz") {
        Ok(SourceKind::Single(Format::Copc))
    } else if file == "ept.json" || !file.contains('.') {
        Ok(SourceKind::Single(Format::Ept))
    } else if file == "cloud.js" {
        Ok(SourceKind::Single(Format::Potree))
    } else if file.ends_with(".vpc") {
        Ok(SourceKind::Composite)
    } else if file == "metadata.json" {
        Err(LoadSourceError::UnsupportedFormat(format!(
            "{} (Potree 2 datasets are not supported)",
            url
        )))
    } else {
        Err(LoadSourceError::UnsupportedFormat(url.to_string()))
    }
}

/// A dataset whose metadata has been read and validated.
#[derive(Clone)]
pub struct OpenedSource {
    pub decoder: Arc<dyn HierarchyDecoder>,
    /// Cubic root voxel box.
    pub bounds: Aabb,
    /// Point spacing at the root.
    pub spacing: f64,
    pub elevation: ElevationRange,
}

impl fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedSource")
            .field("format", &self.decoder.format())
            .field("bounds", &self.bounds)
            .field("spacing", &self.spacing)
            .field("elevation", &self.elevation)
            .finish()
    }
}

/// Opens a single (non composite) dataset.
pub async fn open_source<C>(
    url: &str,
    client: C,
    options: NetworkOptions,
) -> Result<OpenedSource, LoadSourceError>
where
    C: ResourceClient + 'static,
{
    let kind = detect_format(url)?;
    debug!("opening {:?} source {}", kind, url);
    match kind {
        SourceKind::Single(Format::Ept) => EptDecoder::open(url, client, options).await,
        SourceKind::Single(Format::Potree) => PotreeDecoder::open(url, client, options).await,
        SourceKind::Single(Format::Copc) => CopcDecoder::open(url, client, options).await,
        SourceKind::Composite => Err(LoadSourceError::UnsupportedFormat(format!(
            "{} is a composite index, not a single dataset",
            url
        ))),
    }
}
