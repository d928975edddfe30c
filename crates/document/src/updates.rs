use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use model::{NodeId, Rect, UpdateFlags};
use parking_lot::Mutex;
use scheduler::UpdateRequester;

/// Decides whether a projection update request is swallowed before it
/// reaches the scheduler.
pub trait ProjectionUpdatesFilter: Send + Sync {
    /// Returns `true` to drop the request.
    fn filter(&self, node: NodeId, rect: Rect, flags: UpdateFlags) -> bool;
}

impl<F> ProjectionUpdatesFilter for F
where
    F: Fn(NodeId, Rect, UpdateFlags) -> bool + Send + Sync,
{
    fn filter(&self, node: NodeId, rect: Rect, flags: UpdateFlags) -> bool {
        self(node, rect, flags)
    }
}

struct DropAllUpdates;

impl ProjectionUpdatesFilter for DropAllUpdates {
    fn filter(&self, _node: NodeId, _rect: Rect, _flags: UpdateFlags) -> bool {
        true
    }
}

/// Identifies an installed filter for its removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterCookie(u64);

/// Bookkeeping shared between the image, its walker and running strokes.
pub(crate) struct UpdateState {
    bounds: Rect,
    filters: Mutex<Vec<(FilterCookie, Arc<dyn ProjectionUpdatesFilter>)>>,
    next_cookie: AtomicU64,
    filthy: Mutex<HashMap<NodeId, Vec<Rect>>>,
    frame_invalidations: Mutex<Vec<Rect>>,
}

impl UpdateState {
    pub(crate) fn new(bounds: Rect) -> Self {
        Self {
            bounds,
            filters: Mutex::new(Vec::new()),
            next_cookie: AtomicU64::new(1),
            filthy: Mutex::new(HashMap::new()),
            frame_invalidations: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push_filter(&self, filter: Arc<dyn ProjectionUpdatesFilter>) -> FilterCookie {
        let cookie = FilterCookie(self.next_cookie.fetch_add(1, Ordering::Relaxed));
        self.filters.lock().push((cookie, filter));
        cookie
    }

    /// Filters nest; only the most recently installed one may be removed.
    pub(crate) fn pop_filter(&self, cookie: FilterCookie) {
        let mut filters = self.filters.lock();
        match filters.last() {
            Some((top, _)) if *top == cookie => {
                filters.pop();
            }
            _ => panic!("projection updates filter {cookie:?} removed out of order"),
        }
    }

    pub(crate) fn push_drop_all(&self) -> FilterCookie {
        self.push_filter(Arc::new(DropAllUpdates))
    }

    /// Only the innermost filter is consulted.
    fn is_filtered(&self, node: NodeId, rect: Rect, flags: UpdateFlags) -> bool {
        let top = self.filters.lock().last().map(|(_, filter)| filter.clone());
        top.is_some_and(|filter| filter.filter(node, rect, flags))
    }

    fn mark_filthy(&self, node: NodeId, rect: Rect) {
        let mut filthy = self.filthy.lock();
        let rects = filthy.entry(node).or_default();
        if rects.iter().any(|known| known.contains_rect(&rect)) {
            return;
        }
        rects.retain(|known| !rect.contains_rect(known));
        rects.push(rect);
    }

    pub(crate) fn clear_filthy(&self, node: NodeId, rect: Rect) {
        let mut filthy = self.filthy.lock();
        if let Some(rects) = filthy.get_mut(&node) {
            rects.retain(|known| !rect.contains_rect(known));
            if rects.is_empty() {
                filthy.remove(&node);
            }
        }
    }

    pub(crate) fn forget(&self, node: NodeId) {
        self.filthy.lock().remove(&node);
    }

    pub(crate) fn filthy_regions(&self, node: NodeId) -> Vec<Rect> {
        self.filthy.lock().get(&node).cloned().unwrap_or_default()
    }

    pub(crate) fn take_frame_invalidations(&self) -> Vec<Rect> {
        std::mem::take(&mut *self.frame_invalidations.lock())
    }
}

/// Requests projection updates on behalf of an image. Cheap to clone and
/// safe to use from stroke jobs.
#[derive(Clone)]
pub struct ImageUpdater {
    state: Arc<UpdateState>,
    requester: UpdateRequester,
}

impl ImageUpdater {
    pub(crate) fn new(state: Arc<UpdateState>, requester: UpdateRequester) -> Self {
        Self { state, requester }
    }

    /// Applies the installed filter, records frame invalidation and
    /// filthiness as `flags` allow, then queues the recomputation.
    pub fn request_projection_update(&self, node: NodeId, rect: Rect, flags: UpdateFlags) {
        let rect = rect.intersected(&self.state.bounds);
        if rect.is_empty() {
            return;
        }
        if self.state.is_filtered(node, rect, flags) {
            tracing::trace!(?node, ?rect, "projection update filtered");
            return;
        }
        if !flags.contains(UpdateFlags::DONT_INVALIDATE_FRAMES) {
            self.state.frame_invalidations.lock().push(rect);
        }
        if !flags.contains(UpdateFlags::NO_FILTHY) {
            self.state.mark_filthy(node, rect);
        }
        if !self.requester.request_projection_update(node, rect, flags) {
            tracing::debug!(?node, ?rect, "projection update after scheduler shutdown");
        }
    }
}

impl std::fmt::Debug for ImageUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageUpdater")
            .field("bounds", &self.state.bounds)
            .field("requester", &self.requester)
            .finish()
    }
}
