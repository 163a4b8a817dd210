//! A streamed point cloud: the node forest of one dataset (or of every tile of a composite one),
//! the sources that decode it, and the payloads currently resident.

use crate::composite::{bootstrap_tile, CompositeSource, TileBootstrap, TileDescriptor};
use crate::hierarchy::{Expansion, HierarchyDecoder, NodeRequest, ReadHierarchyError};
use crate::loader::CommandError;
use crate::octree::aabb::{Aabb, BoundingVolume, ElevationRange};
use crate::octree::key::VoxelKey;
use crate::octree::node::{CancellationToken, LoadState, NodeAddress, Payload, SourceId, VisibilityFlag};
use crate::octree::snapshot::OctreeNodeSnapshot;
use crate::octree::{NodeId, Octree};
use crate::point::{LoadPointsError, ParseContext, PointBuffer, PointParser};
use crate::resource::{ResourceClient, ResourceError};
use crate::settings::LayerSettings;
use crate::source::{detect_format, open_source, LoadSourceError, OpenedSource, SourceKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use glam::DMat4;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LayerId(pub u64);

/// A source whose metadata has been read.
#[derive(Clone)]
pub struct ReadySource {
    pub decoder: Arc<dyn HierarchyDecoder>,
    /// Point spacing at the root of this source.
    pub spacing: f64,
    pub bounds: Aabb,
}

#[derive(Clone, Default)]
pub enum SourceState {
    /// Composite tile known only from the index.
    #[default]
    Pending,
    Bootstrapping,
    Ready(ReadySource),
    Failed,
}

#[derive(Clone)]
pub struct SourceSlot {
    /// Set for composite tiles.
    pub tile: Option<TileDescriptor>,
    pub state: SourceState,
}

impl SourceSlot {
    pub fn ready(&self) -> Option<&ReadySource> {
        match &self.state {
            SourceState::Ready(ready) => Some(ready),
            _ => None,
        }
    }
}

/// Values read by every node visit of one frame, captured once before the pass.
#[derive(Clone, Debug)]
pub struct TraversalConfig {
    pub sse_threshold: f64,
    pub point_size: f64,
    pub depth_limit: Option<u32>,
    pub min_distance: f64,
    pub elevation: ElevationRange,
    /// Root spacing per source, `None` until the source is ready.
    pub spacing: Vec<Option<f64>>,
}

/// A started point load, to be handed to a scheduler.
pub struct PointsLoad {
    pub task: BoxFuture<'static, Result<PointBuffer, LoadPointsError>>,
    /// Visibility of the requesting node, as decided by the traversal.
    pub requester: VisibilityFlag,
    pub token: CancellationToken,
}

/// A started hierarchy fetch. Its completion is only applied while the node still holds `token`.
pub struct HierarchyLoad {
    pub task: BoxFuture<'static, Result<Vec<u8>, ResourceError>>,
    pub token: CancellationToken,
}

pub struct PointCloudLayer<C> {
    pub(crate) id: LayerId,
    pub(crate) octree: Octree,
    pub(crate) sources: Vec<SourceSlot>,
    pub(crate) elevation: ElevationRange,
    pub(crate) settings: LayerSettings,
    /// Local to world transform of the whole layer.
    pub(crate) transform: DMat4,
    pub(crate) visible: VisibilityFlag,
    /// Nodes holding a payload.
    pub(crate) render_group: BTreeSet<NodeId>,
    client: C,
}

impl<C: ResourceClient + Clone + 'static> PointCloudLayer<C> {
    /// Opens the dataset at `url`. Single datasets get their root hierarchy loaded, composite
    /// ones only get a placeholder root per tile.
    pub async fn open(
        id: LayerId,
        url: &str,
        client: C,
        settings: LayerSettings,
    ) -> Result<Self, LoadSourceError> {
        debug!("opening layer {:?} from {}", id, url);
        match detect_format(url)? {
            SourceKind::Composite => {
                let composite = CompositeSource::open(url, &client, &settings.network_options).await?;
                Ok(Self::from_composite(id, composite, client, settings))
            }
            SourceKind::Single(_) => {
                let source = open_source(url, client.clone(), settings.network_options.clone()).await?;
                let mut layer = Self::from_source(id, source, client, settings);
                if let Some(root) = layer.octree.roots().first().copied() {
                    layer.load_octree(root).await?;
                }
                Ok(layer)
            }
        }
    }

    pub fn from_source(id: LayerId, source: OpenedSource, client: C, settings: LayerSettings) -> Self {
        let elevation = settings.elevation(source.elevation);
        let mut layer = Self::empty(id, elevation, client, settings);
        layer.octree.insert_root(
            SourceId(0),
            source.bounds,
            &elevation,
            None,
            source.decoder.root_address(),
        );
        layer.sources.push(SourceSlot {
            tile: None,
            state: SourceState::Ready(ReadySource {
                decoder: source.decoder,
                spacing: source.spacing,
                bounds: source.bounds,
            }),
        });
        layer
    }

    pub fn from_composite(
        id: LayerId,
        composite: CompositeSource,
        client: C,
        settings: LayerSettings,
    ) -> Self {
        let elevation = settings.elevation(composite.elevation);
        let mut layer = Self::empty(id, elevation, client, settings);
        for (index, tile) in composite.tiles.into_iter().enumerate() {
            layer.octree.insert_root(
                SourceId(index),
                tile.bounds,
                &elevation,
                None,
                NodeAddress::Pending,
            );
            layer.sources.push(SourceSlot {
                tile: Some(tile),
                state: SourceState::Pending,
            });
        }
        layer
    }

    fn empty(id: LayerId, elevation: ElevationRange, client: C, settings: LayerSettings) -> Self {
        Self {
            id,
            octree: Octree::new(),
            sources: Vec::new(),
            elevation,
            settings,
            transform: DMat4::IDENTITY,
            visible: VisibilityFlag::new(true),
            render_group: BTreeSet::new(),
            client,
        }
    }

    /// Starts fetching the bytes of a tile: metadata then root hierarchy.
    /// `None` unless the tile is pending.
    pub fn begin_bootstrap(
        &mut self,
        source: SourceId,
    ) -> Option<BoxFuture<'static, Result<TileBootstrap, LoadSourceError>>> {
        let slot = self.sources.get_mut(source.0)?;
        if !matches!(slot.state, SourceState::Pending) {
            return None;
        }
        let tile = slot.tile.clone()?;
        slot.state = SourceState::Bootstrapping;
        debug!("bootstrapping tile {} ({})", source.0, tile.url);

        let client = self.client.clone();
        let options = self.settings.network_options.clone();
        Some(bootstrap_tile(tile, client, options).boxed())
    }

    /// Binds the placeholder root of `source` to the opened tile and links its first nodes.
    pub fn complete_bootstrap(
        &mut self,
        source: SourceId,
        result: Result<TileBootstrap, LoadSourceError>,
    ) -> Result<Option<NodeId>, LoadSourceError> {
        let Some(slot) = self.sources.get_mut(source.0) else {
            return Ok(None);
        };
        if !matches!(slot.state, SourceState::Bootstrapping) {
            debug!("tile {} was unloaded while opening, result discarded", source.0);
            return Ok(None);
        }
        let bootstrap = match result {
            Ok(bootstrap) => bootstrap,
            Err(error) => {
                warn!("tile {} failed to open: {}", source.0, error);
                slot.state = SourceState::Failed;
                return Err(error);
            }
        };
        let opened = bootstrap.source;
        slot.state = SourceState::Ready(ReadySource {
            decoder: opened.decoder.clone(),
            spacing: opened.spacing,
            bounds: opened.bounds,
        });

        let Some(root) = self.octree.find(source, VoxelKey::ROOT) else {
            return Ok(None);
        };
        let token = CancellationToken::new();
        if let Some(node) = self.octree.node_mut(root) {
            node.bounds = BoundingVolume::new(opened.bounds, &self.elevation);
            node.address = opened.decoder.root_address();
            node.hierarchy = LoadState::Loading(token.clone());
        }
        Ok(self
            .complete_hierarchy_load(root, &token, Ok(bootstrap.hierarchy))?
            .map(|_| root))
    }

    /// Starts a hierarchy fetch for `node`. `None` when the hierarchy is already loaded or
    /// being loaded.
    pub fn begin_hierarchy_load(
        &mut self,
        node: NodeId,
    ) -> Result<Option<HierarchyLoad>, ReadHierarchyError> {
        let n = self.octree.node(node).ok_or(ReadHierarchyError::NodeNotFound)?;
        if matches!(n.hierarchy, LoadState::Loading(_) | LoadState::Loaded) {
            return Ok(None);
        }
        let decoder = self
            .ready_source(n.source)
            .map(|ready| ready.decoder.clone())
            .ok_or(ReadHierarchyError::SourceNotReady)?;
        let request = NodeRequest {
            key: n.key,
            address: n.address.clone(),
        };
        trace!("fetching hierarchy of {}", request.key);

        let token = CancellationToken::new();
        if let Some(n) = self.octree.node_mut(node) {
            n.hierarchy = LoadState::Loading(token.clone());
        }
        Ok(Some(HierarchyLoad {
            task: async move { decoder.fetch_hierarchy(&request).await }.boxed(),
            token,
        }))
    }

    /// Links what `result` describes below `node`. On error the node keeps an unknown point
    /// count, so the load can be started again.
    ///
    /// Returns `Ok(None)` when `node` no longer runs the load started with `token`, for example
    /// because its source was unloaded and the slot reused.
    pub fn complete_hierarchy_load(
        &mut self,
        node: NodeId,
        token: &CancellationToken,
        result: Result<Vec<u8>, ResourceError>,
    ) -> Result<Option<Expansion>, ReadHierarchyError> {
        let Some(n) = self.octree.node(node) else {
            return Ok(None);
        };
        if !n.hierarchy.is_loading_with(token) {
            debug!("stale hierarchy of {} discarded", n.key);
            return Ok(None);
        }
        let source = n.source;
        let decoder = self.ready_source(source).map(|ready| ready.decoder.clone());

        let outcome = match (decoder, result) {
            (None, _) => Err(ReadHierarchyError::SourceNotReady),
            (Some(_), Err(error)) => Err(ReadHierarchyError::from(error)),
            (Some(decoder), Ok(bytes)) => {
                decoder.expand(&mut self.octree, node, &bytes, &self.elevation)
            }
        };

        let Some(n) = self.octree.node_mut(node) else {
            return outcome.map(Some);
        };
        match &outcome {
            Ok(expansion) => {
                if expansion.truncated {
                    warn!("hierarchy of {} is truncated", n.key);
                }
                n.hierarchy = if n.hierarchy_loaded() {
                    LoadState::Loaded
                } else {
                    LoadState::Failed
                };
            }
            Err(error) => {
                warn!("hierarchy of {} failed: {}", n.key, error);
                n.hierarchy = LoadState::Failed;
            }
        }
        outcome.map(Some)
    }

    /// Loads the hierarchy of `node`. Calling it again while a load is running, or once it has
    /// succeeded, does nothing.
    pub async fn load_octree(&mut self, node: NodeId) -> Result<Option<Expansion>, ReadHierarchyError> {
        let Some(load) = self.begin_hierarchy_load(node)? else {
            return Ok(None);
        };
        let result = load.task.await;
        self.complete_hierarchy_load(node, &load.token, result)
    }

    /// Starts fetching and parsing the points of `node`. `None` when a payload is resident or
    /// a load is in flight.
    pub fn begin_points_load(
        &mut self,
        node: NodeId,
        parser: Arc<dyn PointParser>,
    ) -> Result<Option<PointsLoad>, LoadPointsError> {
        let n = self.octree.node(node).ok_or(LoadPointsError::NodeNotFound)?;
        if matches!(n.content, LoadState::Loading(_) | LoadState::Loaded) {
            return Ok(None);
        }
        let num_points = match n.num_points {
            None => return Err(LoadPointsError::HierarchyNotLoaded),
            Some(0) => return Err(LoadPointsError::EmptyNode),
            Some(count) => count,
        };
        let decoder = self
            .ready_source(n.source)
            .map(|ready| ready.decoder.clone())
            .ok_or(LoadPointsError::SourceNotReady)?;

        let request = NodeRequest {
            key: n.key,
            address: n.address.clone(),
        };
        let context = ParseContext {
            format: decoder.format(),
            source: n.source,
            key: n.key,
            num_points,
            voxel_box: n.bounds.voxel,
        };
        let requester = n.visible.clone();
        let token = CancellationToken::new();

        if let Some(n) = self.octree.node_mut(node) {
            n.content = LoadState::Loading(token.clone());
        }

        let task = async move {
            let bytes = decoder.fetch_content(&request).await?;
            parser.parse(bytes, &context)
        }
        .boxed();

        Ok(Some(PointsLoad {
            task,
            requester,
            token,
        }))
    }

    /// Applies the outcome of a point load. Returns whether a payload was attached.
    ///
    /// Outcomes of loads `node` no longer runs (evicted, unloaded, slot reused) are discarded.
    pub fn complete_points_load(
        &mut self,
        node: NodeId,
        token: &CancellationToken,
        result: Result<PointBuffer, CommandError>,
    ) -> Result<bool, LoadPointsError> {
        let Some(n) = self.octree.node_mut(node) else {
            return Ok(false);
        };
        if !n.content.is_loading_with(token) {
            debug!("stale load of {} discarded", n.key);
            return Ok(false);
        }
        match result {
            Ok(buffer) => {
                if !buffer.is_empty() {
                    n.tight_box = Some(buffer.tight_box);
                }
                trace!("{} points resident for {}", buffer.len(), n.key);
                n.payload = Some(Payload {
                    buffer,
                    visible: n.visible.get(),
                });
                n.content = LoadState::Loaded;
                self.render_group.insert(node);
                Ok(true)
            }
            Err(CommandError::Cancelled) => {
                debug!("load of {} dropped", n.key);
                n.content = LoadState::Idle;
                Ok(false)
            }
            Err(CommandError::Failed(error)) => {
                warn!("load of {} failed: {}", n.key, error);
                n.content = LoadState::Failed;
                Err(error)
            }
        }
    }

    /// Loads the points of `node` without going through a scheduler.
    pub async fn load(&mut self, node: NodeId, parser: Arc<dyn PointParser>) -> Result<bool, LoadPointsError> {
        let Some(load) = self.begin_points_load(node, parser)? else {
            return Ok(false);
        };
        let result = load.task.await.map_err(CommandError::Failed);
        self.complete_points_load(node, &load.token, result)
    }
}

impl<C> PointCloudLayer<C> {
    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    pub fn roots(&self) -> &[NodeId] {
        self.octree.roots()
    }

    pub fn settings(&self) -> &LayerSettings {
        &self.settings
    }

    pub fn elevation(&self) -> ElevationRange {
        self.elevation
    }

    pub fn source(&self, source: SourceId) -> Option<&SourceSlot> {
        self.sources.get(source.0)
    }

    pub fn sources(&self) -> &[SourceSlot] {
        &self.sources
    }

    pub(crate) fn ready_source(&self, source: SourceId) -> Option<&ReadySource> {
        self.sources.get(source.0).and_then(SourceSlot::ready)
    }

    pub fn is_visible(&self) -> bool {
        self.visible.get()
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.set(visible);
    }

    /// Shared flag, for early drop predicates.
    pub fn visibility(&self) -> VisibilityFlag {
        self.visible.clone()
    }

    pub fn transform(&self) -> DMat4 {
        self.transform
    }

    pub fn set_transform(&mut self, transform: DMat4) {
        self.transform = transform;
    }

    pub fn traversal_config(&self) -> TraversalConfig {
        TraversalConfig {
            sse_threshold: self.settings.sse_threshold,
            point_size: self.settings.point_size,
            depth_limit: self.settings.octree_depth_limit,
            min_distance: self.settings.min_distance,
            elevation: self.elevation,
            spacing: self
                .sources
                .iter()
                .map(|slot| slot.ready().map(|ready| ready.spacing))
                .collect(),
        }
    }

    /// Hides the payloads of `node` and all its descendants, stamping when they went missing.
    /// Hierarchy and children are left untouched.
    pub fn hide_subtree(&mut self, node: NodeId, now: Instant) {
        for id in self.octree.subtree(node) {
            if let Some(n) = self.octree.node_mut(id) {
                n.mark_invisible(now);
            }
        }
    }

    /// Releases payloads that have not been seen for the configured delay.
    pub fn evict_invisible(&mut self, now: Instant) -> usize {
        let delay = self.settings.eviction_delay();
        let mut evicted = Vec::new();
        for id in &self.render_group {
            let Some(n) = self.octree.node_mut(*id) else {
                evicted.push(*id);
                continue;
            };
            let expired = n
                .not_visible_since
                .is_some_and(|since| now.saturating_duration_since(since) >= delay);
            if expired {
                n.payload = None;
                n.content = LoadState::Idle;
                evicted.push(*id);
            }
        }
        for id in &evicted {
            self.render_group.remove(id);
        }
        if !evicted.is_empty() {
            debug!("evicted {} payloads", evicted.len());
        }
        evicted.len()
    }

    /// Payloads to draw this frame.
    pub fn visible_payloads(&self) -> impl Iterator<Item = (NodeId, &PointBuffer)> + '_ {
        self.render_group.iter().filter_map(|id| {
            let payload = self.octree.node(*id)?.payload.as_ref()?;
            payload.visible.then_some((*id, &payload.buffer))
        })
    }

    pub fn resident_payloads(&self) -> usize {
        self.render_group.len()
    }

    /// Takes a snapshot of the currently loaded hierarchy, one tree per source.
    pub fn hierarchy_snapshot(&self) -> Vec<OctreeNodeSnapshot> {
        self.roots()
            .iter()
            .filter_map(|root| self.octree.snapshot(*root))
            .collect()
    }

    /// Flags the pending point load of `node` so the scheduler drops it.
    pub fn cancel_load(&self, node: NodeId) -> bool {
        match self.octree.node(node).map(|n| &n.content) {
            Some(LoadState::Loading(token)) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Makes a failed node, or the failed tile it is the root of, eligible for loading again.
    pub fn retry(&mut self, node: NodeId) -> bool {
        let Some(n) = self.octree.node_mut(node) else {
            return false;
        };
        let mut reset = false;
        if matches!(n.hierarchy, LoadState::Failed) {
            n.hierarchy = LoadState::Idle;
            reset = true;
        }
        if matches!(n.content, LoadState::Failed) {
            n.content = LoadState::Idle;
            reset = true;
        }
        let (source, is_root) = (n.source, n.parent.is_none());
        if is_root {
            if let Some(slot) = self.sources.get_mut(source.0) {
                if matches!(slot.state, SourceState::Failed) {
                    slot.state = SourceState::Pending;
                    reset = true;
                }
            }
        }
        reset
    }

    /// Destroys every node of `source` and puts back a fresh, unloaded root.
    pub fn unload_source(&mut self, source: SourceId) -> usize {
        let Some(slot) = self.sources.get(source.0) else {
            return 0;
        };
        let (bounds, address) = match (&slot.state, &slot.tile) {
            (SourceState::Ready(ready), None) => (ready.bounds, ready.decoder.root_address()),
            (_, Some(tile)) => (tile.bounds, NodeAddress::Pending),
            (_, None) => return 0,
        };

        for id in self.octree.subtree_of_source(source) {
            if let Some(n) = self.octree.node(id) {
                for state in [&n.content, &n.hierarchy] {
                    if let LoadState::Loading(token) = state {
                        token.cancel();
                    }
                }
            }
            self.render_group.remove(&id);
        }
        let removed = self.octree.remove_source(source);

        if let Some(slot) = self.sources.get_mut(source.0) {
            if slot.tile.is_some() {
                slot.state = SourceState::Pending;
            }
        }
        self.octree
            .insert_root(source, bounds, &self.elevation, None, address);
        debug!("unloaded source {}: {} nodes", source.0, removed);
        removed
    }
}
