//! Background loads of one layer. Point loads go through a [`Scheduler`], structural loads
//! (hierarchies and composite tiles) are awaited directly. Completions are applied to the layer
//! only when [`LoadOrchestrator::process_completions`] is called, between two frames.

use crate::composite::TileBootstrap;
use crate::hierarchy::ReadHierarchyError;
use crate::layer::{LayerId, PointCloudLayer};
use crate::octree::node::{CancellationToken, SourceId};
use crate::octree::NodeId;
use crate::point::{LoadPointsError, PointBuffer, PointParser};
use crate::resource::{ResourceClient, ResourceError};
use crate::source::LoadSourceError;
use crate::traversal::Change;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Command cancelled")]
    Cancelled,

    #[error("Command failed: {0}")]
    Failed(#[from] LoadPointsError),
}

pub type EarlyDrop = Box<dyn Fn() -> bool + Send + Sync>;

/// One prioritized unit of work handed to a [`Scheduler`].
pub struct Command {
    pub layer: LayerId,
    pub requester: NodeId,
    /// Higher runs first. Advisory only.
    pub priority: f64,
    early_drop: EarlyDrop,
    task: BoxFuture<'static, Result<PointBuffer, LoadPointsError>>,
}

impl Command {
    pub fn new(
        layer: LayerId,
        requester: NodeId,
        priority: f64,
        early_drop: EarlyDrop,
        task: BoxFuture<'static, Result<PointBuffer, LoadPointsError>>,
    ) -> Self {
        Self {
            layer,
            requester,
            priority,
            early_drop,
            task,
        }
    }

    /// Re-checked by the scheduler when the command is dequeued.
    pub fn should_drop(&self) -> bool {
        (self.early_drop)()
    }

    /// Runs the command, unless it should be dropped.
    pub async fn run(self) -> Result<PointBuffer, CommandError> {
        if self.should_drop() {
            return Err(CommandError::Cancelled);
        }
        Ok(self.task.await?)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("layer", &self.layer)
            .field("requester", &self.requester)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Prioritized execution of point loads. Implementations decide ordering and concurrency, and
/// resolve dropped commands with [`CommandError::Cancelled`].
pub trait Scheduler: Send + Sync {
    fn execute(&self, command: Command) -> BoxFuture<'static, Result<PointBuffer, CommandError>>;
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn execute(&self, command: Command) -> BoxFuture<'static, Result<PointBuffer, CommandError>> {
        (**self).execute(command)
    }
}

/// Runs every command as soon as it is polled, without any queueing.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn execute(&self, command: Command) -> BoxFuture<'static, Result<PointBuffer, CommandError>> {
        command.run().boxed()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LoadRequest {
    Points { node: NodeId, priority: f64 },
    Hierarchy { node: NodeId },
    /// Open a composite tile and bind its root.
    Bootstrap { source: SourceId },
}

#[derive(Debug)]
pub enum LoadFailure {
    Points {
        node: NodeId,
        error: LoadPointsError,
    },
    Hierarchy {
        node: NodeId,
        error: ReadHierarchyError,
    },
    Bootstrap {
        source: SourceId,
        error: LoadSourceError,
    },
}

/// What applying a batch of completions changed.
#[derive(Debug, Default)]
pub struct CompletionReport {
    /// Nodes whose content or hierarchy changed, to feed the next frame.
    pub changes: Vec<Change>,
    pub failures: Vec<LoadFailure>,
    /// Loads dropped by the scheduler, or finished after their node stopped waiting for them.
    pub cancelled: usize,
}

impl CompletionReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.failures.is_empty() && self.cancelled == 0
    }

    fn merge(&mut self, other: CompletionReport) {
        self.changes.extend(other.changes);
        self.failures.extend(other.failures);
        self.cancelled += other.cancelled;
    }
}

enum Completion {
    Points {
        node: NodeId,
        token: CancellationToken,
        result: Result<PointBuffer, CommandError>,
    },
    Hierarchy {
        node: NodeId,
        token: CancellationToken,
        result: Result<Vec<u8>, ResourceError>,
    },
    Bootstrap {
        source: SourceId,
        result: Result<TileBootstrap, LoadSourceError>,
    },
}

pub struct LoadOrchestrator<S> {
    scheduler: S,
    parser: Arc<dyn PointParser>,
    pending: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl<S: Scheduler> LoadOrchestrator<S> {
    pub fn new(scheduler: S, parser: Arc<dyn PointParser>) -> Self {
        Self {
            scheduler,
            parser,
            pending: FuturesUnordered::new(),
        }
    }

    /// Loads started and not yet applied.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Starts the requests of a frame. Requests that cannot start are logged and skipped so one
    /// broken branch does not hold back the others.
    pub fn dispatch<C>(&mut self, layer: &mut PointCloudLayer<C>, requests: Vec<LoadRequest>) -> usize
    where
        C: ResourceClient + Clone + 'static,
    {
        let mut started = 0;
        for request in requests {
            let outcome = match request {
                LoadRequest::Points { node, priority } => self
                    .request_points(layer, node, priority)
                    .map_err(|e| e.to_string()),
                LoadRequest::Hierarchy { node } => {
                    self.request_hierarchy(layer, node).map_err(|e| e.to_string())
                }
                LoadRequest::Bootstrap { source } => Ok(self.request_bootstrap(layer, source)),
            };
            match outcome {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(error) => warn!("{:?} not started: {}", request, error),
            }
        }
        started
    }

    /// Queues the points of `node` on the scheduler. `false` when a payload is resident or a
    /// load is already in flight.
    pub fn request_points<C>(
        &mut self,
        layer: &mut PointCloudLayer<C>,
        node: NodeId,
        priority: f64,
    ) -> Result<bool, LoadPointsError>
    where
        C: ResourceClient + Clone + 'static,
    {
        let Some(load) = layer.begin_points_load(node, self.parser.clone())? else {
            return Ok(false);
        };

        let layer_visible = layer.visibility();
        let requester = load.requester;
        let token = load.token;
        let drop_token = token.clone();
        let early_drop: EarlyDrop = Box::new(move || {
            !requester.get() || !layer_visible.get() || drop_token.is_cancelled()
        });

        let command = Command::new(layer.id(), node, priority, early_drop, load.task);
        let execution = self.scheduler.execute(command);
        self.pending.push(
            async move {
                Completion::Points {
                    node,
                    token,
                    result: execution.await,
                }
            }
            .boxed(),
        );
        Ok(true)
    }

    pub fn request_hierarchy<C>(
        &mut self,
        layer: &mut PointCloudLayer<C>,
        node: NodeId,
    ) -> Result<bool, ReadHierarchyError>
    where
        C: ResourceClient + Clone + 'static,
    {
        let Some(load) = layer.begin_hierarchy_load(node)? else {
            return Ok(false);
        };
        let token = load.token;
        let task = load.task;
        self.pending.push(
            async move {
                Completion::Hierarchy {
                    node,
                    token,
                    result: task.await,
                }
            }
            .boxed(),
        );
        Ok(true)
    }

    pub fn request_bootstrap<C>(&mut self, layer: &mut PointCloudLayer<C>, source: SourceId) -> bool
    where
        C: ResourceClient + Clone + 'static,
    {
        let Some(task) = layer.begin_bootstrap(source) else {
            return false;
        };
        self.pending.push(
            async move {
                Completion::Bootstrap {
                    source,
                    result: task.await,
                }
            }
            .boxed(),
        );
        true
    }

    /// Applies every load that has already finished, without waiting.
    pub fn process_completions<C>(&mut self, layer: &mut PointCloudLayer<C>) -> CompletionReport
    where
        C: ResourceClient + Clone + 'static,
    {
        let mut report = CompletionReport::default();
        while let Some(Some(completion)) = self.pending.next().now_or_never() {
            report.merge(apply(layer, completion));
        }
        report
    }

    /// Waits for the next load to finish and applies it. `None` when nothing is in flight.
    pub async fn wait_next<C>(&mut self, layer: &mut PointCloudLayer<C>) -> Option<CompletionReport>
    where
        C: ResourceClient + Clone + 'static,
    {
        let completion = self.pending.next().await?;
        Some(apply(layer, completion))
    }

    /// Waits for every load in flight, including the ones started by completions.
    pub async fn wait_all<C>(&mut self, layer: &mut PointCloudLayer<C>) -> CompletionReport
    where
        C: ResourceClient + Clone + 'static,
    {
        let mut report = CompletionReport::default();
        while let Some(next) = self.wait_next(layer).await {
            report.merge(next);
        }
        report
    }
}

fn apply<C>(layer: &mut PointCloudLayer<C>, completion: Completion) -> CompletionReport
where
    C: ResourceClient + Clone + 'static,
{
    let mut report = CompletionReport::default();
    let layer_id = layer.id();
    match completion {
        Completion::Points {
            node,
            token,
            result,
        } => match layer.complete_points_load(node, &token, result) {
            Ok(true) => report.changes.push(Change::Node(layer_id, node)),
            Ok(false) => report.cancelled += 1,
            Err(error) => report.failures.push(LoadFailure::Points { node, error }),
        },
        Completion::Hierarchy {
            node,
            token,
            result,
        } => match layer.complete_hierarchy_load(node, &token, result) {
            Ok(Some(expansion)) => {
                debug!("{} nodes linked", expansion.created.len());
                report.changes.push(Change::Node(layer_id, node));
            }
            Ok(None) => report.cancelled += 1,
            Err(error) => report.failures.push(LoadFailure::Hierarchy { node, error }),
        },
        Completion::Bootstrap { source, result } => match layer.complete_bootstrap(source, result) {
            Ok(Some(root)) => report.changes.push(Change::Node(layer_id, root)),
            Ok(None) => report.cancelled += 1,
            Err(error) => report.failures.push(LoadFailure::Bootstrap { source, error }),
        },
    }
    report
}
