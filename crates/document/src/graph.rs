use std::sync::Arc;

use model::{NodeId, Rect};
use slotmap::SlotMap;
use tiles::TiledDataManager;

use crate::DocumentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    PaintLayer,
    Group,
}

pub(crate) struct Node {
    name: String,
    kind: NodeKind,
    parent: Option<NodeId>,
    /// Bottom to top.
    children: Vec<NodeId>,
    /// Paint content for layers, the composited projection for groups.
    device: Arc<TiledDataManager>,
}

impl Node {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub(crate) fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub(crate) fn device(&self) -> &Arc<TiledDataManager> {
        &self.device
    }
}

pub(crate) struct NodeGraph {
    nodes: SlotMap<NodeId, Node>,
    root: NodeId,
}

impl NodeGraph {
    pub(crate) fn new(root_projection: Arc<TiledDataManager>) -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Node {
            name: "root".to_owned(),
            kind: NodeKind::Group,
            parent: None,
            children: Vec::new(),
            device: root_projection,
        });
        Self { nodes, root }
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&Node, DocumentError> {
        self.nodes.get(id).ok_or(DocumentError::UnknownNode(id))
    }

    /// Adds a node on top of `parent`'s children.
    pub(crate) fn insert(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        device: Arc<TiledDataManager>,
    ) -> Result<NodeId, DocumentError> {
        if self.node(parent)?.kind != NodeKind::Group {
            return Err(DocumentError::NotAGroup(parent));
        }
        let id = self.nodes.insert(Node {
            name: name.to_owned(),
            kind,
            parent: Some(parent),
            children: Vec::new(),
            device,
        });
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Removes `id` and its subtree. Returns the former parent, the area
    /// the subtree covered and every removed id.
    pub(crate) fn remove(
        &mut self,
        id: NodeId,
    ) -> Result<(NodeId, Rect, Vec<NodeId>), DocumentError> {
        if id == self.root {
            return Err(DocumentError::RootRemoval);
        }
        let node = self.node(id)?;
        let Some(parent) = node.parent else {
            panic!("non-root node {id:?} has no parent");
        };
        self.nodes[parent].children.retain(|child| *child != id);

        let mut covered = Rect::empty();
        let mut removed = Vec::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            removed.push(next);
            let Some(node) = self.nodes.remove(next) else {
                panic!("node tree references missing node {next:?}");
            };
            covered = covered.united(&node.device.extent());
            pending.extend(node.children);
        }
        Ok((parent, covered, removed))
    }

    /// Rebuilds `group`'s projection over `rect` from its children, bottom
    /// to top. A child pixel that differs from the default covers whatever
    /// lies below it.
    pub(crate) fn composite(&self, group: NodeId, rect: Rect) {
        let group = &self.nodes[group];
        let device = &group.device;
        let pixel_size = device.pixel_size();
        let default_pixel = device.default_pixel();
        let len = rect.area() as usize * pixel_size;

        let mut output = vec![0; len];
        for pixel in output.chunks_exact_mut(pixel_size) {
            pixel.copy_from_slice(&default_pixel);
        }
        let mut layer = vec![0; len];
        for child in &group.children {
            let child = &self.nodes[*child].device;
            if !child.extent().intersects(&rect) {
                continue;
            }
            child.read_bytes(rect, &mut layer);
            for (target, source) in output
                .chunks_exact_mut(pixel_size)
                .zip(layer.chunks_exact(pixel_size))
            {
                if source != &*default_pixel {
                    target.copy_from_slice(source);
                }
            }
        }
        device.write_bytes(rect, &output);
        device.purge(rect);
    }
}
