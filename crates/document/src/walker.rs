use std::sync::Arc;

use model::{NodeId, Rect, UpdateFlags};
use parking_lot::RwLock;
use scheduler::{JobContext, JobError, ProjectionWalker};

use crate::graph::{NodeGraph, NodeKind};
use crate::updates::UpdateState;

/// Recomposites every group from the updated node up to the root.
pub(crate) struct CompositeWalker {
    graph: Arc<RwLock<NodeGraph>>,
    updates: Arc<UpdateState>,
}

impl CompositeWalker {
    pub(crate) fn new(graph: Arc<RwLock<NodeGraph>>, updates: Arc<UpdateState>) -> Self {
        Self { graph, updates }
    }
}

impl ProjectionWalker for CompositeWalker {
    fn recompute(
        &self,
        node: NodeId,
        rect: Rect,
        _flags: UpdateFlags,
        context: &JobContext,
    ) -> Result<(), JobError> {
        let graph = self.graph.read();
        let Ok(updated) = graph.node(node) else {
            tracing::trace!(?node, ?rect, "skipping update of removed node");
            return Ok(());
        };
        self.updates.clear_filthy(node, rect);

        let mut next = match updated.kind() {
            NodeKind::Group => Some(node),
            NodeKind::PaintLayer => updated.parent(),
        };
        while let Some(group) = next {
            graph.composite(group, rect);
            next = graph.node(group).ok().and_then(|group| group.parent());
        }
        tracing::trace!(job = context.job_id().0, ?node, ?rect, "projection recomputed");
        Ok(())
    }
}
