use std::sync::Arc;

use crossbeam_channel::Receiver;
use model::{JobId, NodeId, Rect, StrokeId, UpdateFlags};
use parking_lot::RwLock;
use scheduler::{
    BarrierLockable, BarrierLocker, SchedulerConfig, SchedulerEvent, StrokeJob, StrokeStrategy,
    UpdateScheduler,
};
use tiles::{MemoryManager, TiledDataManager};

use crate::config::CoreConfig;
use crate::graph::{NodeGraph, NodeKind};
use crate::updates::{FilterCookie, ImageUpdater, ProjectionUpdatesFilter, UpdateState};
use crate::walker::CompositeWalker;
use crate::DocumentError;

/// A layered image: a node tree of paint layers and groups, the root's
/// projection, and the scheduler that keeps projections current.
pub struct Image {
    scheduler: UpdateScheduler,
    bounds: Rect,
    pixel_size: usize,
    default_pixel: Box<[u8]>,
    memory: Arc<MemoryManager>,
    projection: Arc<TiledDataManager>,
    graph: Arc<RwLock<NodeGraph>>,
    updates: Arc<UpdateState>,
    updater: ImageUpdater,
}

impl Image {
    pub fn new(
        width: i32,
        height: i32,
        pixel_size: usize,
        default_pixel: &[u8],
        memory: Arc<MemoryManager>,
        config: SchedulerConfig,
    ) -> Result<Self, DocumentError> {
        if width <= 0 || height <= 0 {
            return Err(DocumentError::EmptyImage { width, height });
        }
        if default_pixel.len() != pixel_size {
            return Err(DocumentError::DefaultPixelSize {
                expected: pixel_size,
                found: default_pixel.len(),
            });
        }
        let bounds = Rect::new(0, 0, width, height);
        let root_projection = Arc::new(TiledDataManager::new(
            pixel_size,
            default_pixel,
            memory.clone(),
        )?);
        let graph = Arc::new(RwLock::new(NodeGraph::new(root_projection.clone())));
        let updates = Arc::new(UpdateState::new(bounds));
        let walker = Arc::new(CompositeWalker::new(graph.clone(), updates.clone()));
        let scheduler = UpdateScheduler::new(config, walker)?;
        let updater = ImageUpdater::new(updates.clone(), scheduler.requester());
        tracing::debug!(width, height, pixel_size, "image created");
        Ok(Self {
            scheduler,
            bounds,
            pixel_size,
            default_pixel: default_pixel.into(),
            memory,
            projection: root_projection,
            graph,
            updates,
            updater,
        })
    }

    /// Builds the memory manager and scheduler from one config.
    pub fn from_config(
        width: i32,
        height: i32,
        pixel_size: usize,
        default_pixel: &[u8],
        config: &CoreConfig,
    ) -> Result<Self, DocumentError> {
        config.validate()?;
        let memory = MemoryManager::new(config.memory.clone())?;
        Self::new(width, height, pixel_size, default_pixel, memory, config.scheduler)
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn pixel_size(&self) -> usize {
        self.pixel_size
    }

    pub fn default_pixel(&self) -> &[u8] {
        &self.default_pixel
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn root(&self) -> NodeId {
        self.graph.read().root()
    }

    /// The composited image.
    pub fn projection(&self) -> Arc<TiledDataManager> {
        self.projection.clone()
    }

    pub fn add_paint_layer(&self, parent: NodeId, name: &str) -> Result<NodeId, DocumentError> {
        self.add_node(parent, name, NodeKind::PaintLayer)
    }

    pub fn add_group(&self, parent: NodeId, name: &str) -> Result<NodeId, DocumentError> {
        self.add_node(parent, name, NodeKind::Group)
    }

    fn add_node(&self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId, DocumentError> {
        let device = Arc::new(TiledDataManager::new(
            self.pixel_size,
            &self.default_pixel,
            self.memory.clone(),
        )?);
        let _locker = BarrierLocker::new(&self.scheduler);
        let id = self.graph.write().insert(parent, name, kind, device)?;
        tracing::debug!(?id, ?parent, ?kind, name, "node added");
        Ok(id)
    }

    /// Removes `node` with its subtree and recomposites what it covered.
    pub fn remove_node(&self, node: NodeId) -> Result<(), DocumentError> {
        let (parent, covered, removed) = {
            let _locker = BarrierLocker::new(&self.scheduler);
            self.graph.write().remove(node)?
        };
        for id in removed {
            self.updates.forget(id);
        }
        tracing::debug!(?node, ?parent, ?covered, "node removed");
        self.updater
            .request_projection_update(parent, covered, UpdateFlags::NO_FILTHY);
        Ok(())
    }

    pub fn node_kind(&self, node: NodeId) -> Result<NodeKind, DocumentError> {
        Ok(self.graph.read().node(node)?.kind())
    }

    pub fn node_name(&self, node: NodeId) -> Result<String, DocumentError> {
        Ok(self.graph.read().node(node)?.name().to_owned())
    }

    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>, DocumentError> {
        Ok(self.graph.read().node(node)?.parent())
    }

    /// Children bottom to top.
    pub fn children(&self, node: NodeId) -> Result<Vec<NodeId>, DocumentError> {
        Ok(self.graph.read().node(node)?.children().to_vec())
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.graph.read().contains(node)
    }

    /// Paint content for layers, the projection for groups.
    pub fn device(&self, node: NodeId) -> Result<Arc<TiledDataManager>, DocumentError> {
        Ok(self.graph.read().node(node)?.device().clone())
    }

    pub fn paint_device(&self, layer: NodeId) -> Result<Arc<TiledDataManager>, DocumentError> {
        let graph = self.graph.read();
        let node = graph.node(layer)?;
        if node.kind() != NodeKind::PaintLayer {
            return Err(DocumentError::NotAPaintLayer(layer));
        }
        Ok(node.device().clone())
    }

    pub fn request_projection_update(&self, node: NodeId, rect: Rect, flags: UpdateFlags) {
        self.updater.request_projection_update(node, rect, flags);
    }

    pub fn updater(&self) -> ImageUpdater {
        self.updater.clone()
    }

    pub fn add_projection_updates_filter(
        &self,
        filter: Arc<dyn ProjectionUpdatesFilter>,
    ) -> FilterCookie {
        self.updates.push_filter(filter)
    }

    /// # Panics
    ///
    /// Panics unless `cookie` names the most recently added filter.
    pub fn remove_projection_updates_filter(&self, cookie: FilterCookie) {
        self.updates.pop_filter(cookie);
    }

    /// Drops every projection update request until the returned cookie is
    /// handed to [`Image::enable_dirty_requests`].
    pub fn disable_dirty_requests(&self) -> FilterCookie {
        self.updates.push_drop_all()
    }

    pub fn enable_dirty_requests(&self, cookie: FilterCookie) {
        self.updates.pop_filter(cookie);
    }

    /// Rects of `node` whose own content changed and has not been
    /// recomposited yet.
    pub fn filthy_regions(&self, node: NodeId) -> Vec<Rect> {
        self.updates.filthy_regions(node)
    }

    /// Areas whose cached animation frames went stale since the last call.
    pub fn take_frame_invalidations(&self) -> Vec<Rect> {
        self.updates.take_frame_invalidations()
    }

    pub fn start_stroke(&self, strategy: Arc<dyn StrokeStrategy>) -> StrokeId {
        self.scheduler.start_stroke(strategy)
    }

    pub fn add_job(&self, stroke: StrokeId, job: Box<dyn StrokeJob>) -> Result<JobId, DocumentError> {
        Ok(self.scheduler.add_job(stroke, job)?)
    }

    pub fn end_stroke(&self, stroke: StrokeId) -> Result<(), DocumentError> {
        Ok(self.scheduler.end_stroke(stroke)?)
    }

    pub fn cancel_stroke(&self, stroke: StrokeId) -> Result<(), DocumentError> {
        Ok(self.scheduler.cancel_stroke(stroke)?)
    }

    pub fn wait_for_done(&self) {
        self.scheduler.wait_for_done();
    }

    pub fn events(&self) -> Receiver<SchedulerEvent> {
        self.scheduler.events()
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }
}

impl BarrierLockable for Image {
    fn barrier_lock(&self) {
        self.scheduler.barrier_lock();
    }

    fn try_barrier_lock(&self) -> bool {
        self.scheduler.try_barrier_lock()
    }

    fn unlock(&self) {
        self.scheduler.unlock();
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("bounds", &self.bounds)
            .field("pixel_size", &self.pixel_size)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
