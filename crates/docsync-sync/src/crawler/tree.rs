//! Index-based object tree
//!
//! Nodes live in one vector and refer to each other by [`NodeId`]; parents
//! are always inserted before their children.

/// Index of a node in an [`ObjectTree`]
pub type NodeId = usize;

#[derive(Debug, Clone)]
struct Node<T> {
    item: T,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena tree of crawled objects
#[derive(Debug, Clone)]
pub struct ObjectTree<T> {
    nodes: Vec<Node<T>>,
}

impl<T> ObjectTree<T> {
    pub const ROOT: NodeId = 0;

    pub fn new(root: T) -> Self {
        Self {
            nodes: vec![Node {
                item: root,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    /// Appends `item` below `parent`
    ///
    /// # Panics
    ///
    /// Panics if `parent` is not a node of this tree.
    pub fn add_child(&mut self, parent: NodeId, item: T) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            item,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn item(&self, id: NodeId) -> &T {
        &self.nodes[id].item
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in depth-first pre-order, root first
    pub fn dfs(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![Self::ROOT];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().rev());
        }
        order
    }
}
