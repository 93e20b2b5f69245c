//! Stable row identities for a replicated tree.
//!
//! Every row the replica knows about gets a [`NodeId`] that never changes
//! while the row exists. Structural changes renumber positions by editing
//! the parent's child list; the ids themselves stay put, so anything keyed
//! by id (cached data, pending requests) follows its row.

use std::collections::HashMap;
use std::fmt;

use repliq_protocol::IndexPath;

/// Stable identity of a row (or of the invisible root).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    /// Child rows, or `None` while the child count is unknown.
    children: Option<Vec<NodeId>>,
    /// Column count of the child rows.
    columns: u32,
    /// What the source said about children before they were fetched.
    has_children: bool,
}

impl Node {
    fn new(parent: Option<NodeId>) -> Self {
        Self {
            parent,
            children: None,
            columns: 0,
            has_children: false,
        }
    }
}

/// The replica's view of the model's shape.
#[derive(Debug)]
pub struct NodeTree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next: u64,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    /// A tree holding only an empty root.
    pub fn new() -> Self {
        let root = NodeId(0);
        let mut node = Node::new(None);
        node.children = Some(Vec::new());
        let mut nodes = HashMap::new();
        nodes.insert(root, node);
        Self {
            nodes,
            root,
            next: 1,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of known nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    fn fresh(&mut self, parent: NodeId) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        self.nodes.insert(id, Node::new(Some(parent)));
        id
    }

    /// Removes `id` and its descendants, collecting their ids into `out`.
    fn drop_subtree(&mut self, id: NodeId, out: &mut Vec<NodeId>) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                stack.extend(node.children.into_iter().flatten());
                out.push(next);
            }
        }
    }

    /// Replaces the children of `parent` with `rows` fresh rows. Returns
    /// the ids that were dropped.
    pub fn set_children(&mut self, parent: NodeId, rows: u32, columns: u32) -> Vec<NodeId> {
        let mut dropped = Vec::new();
        let Some(old) = self.nodes.get_mut(&parent).map(|n| n.children.take()) else {
            return dropped;
        };
        for child in old.into_iter().flatten() {
            self.drop_subtree(child, &mut dropped);
        }
        let children: Vec<NodeId> = (0..rows).map(|_| self.fresh(parent)).collect();
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.has_children = rows > 0;
            node.children = Some(children);
            node.columns = columns;
        }
        dropped
    }

    /// Forgets everything and gives the root `rows` fresh rows. Returns
    /// the dropped ids.
    pub fn reset(&mut self, rows: u32, columns: u32) -> Vec<NodeId> {
        self.set_children(self.root, rows, columns)
    }

    /// Child ids of `parent`, or `None` if unknown.
    pub fn children(&self, parent: NodeId) -> Option<&[NodeId]> {
        self.nodes.get(&parent)?.children.as_deref()
    }

    pub fn child(&self, parent: NodeId, row: u32) -> Option<NodeId> {
        self.children(parent)?.get(row as usize).copied()
    }

    pub fn row_count(&self, parent: NodeId) -> Option<u32> {
        self.children(parent).map(|c| c.len() as u32)
    }

    pub fn column_count(&self, parent: NodeId) -> u32 {
        self.nodes.get(&parent).map_or(0, |n| n.columns)
    }

    pub fn set_column_count(&mut self, parent: NodeId, columns: u32) {
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.columns = columns;
        }
    }

    /// Whether `id` has (or is said to have) children.
    pub fn has_children(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|n| match &n.children {
            Some(children) => !children.is_empty(),
            None => n.has_children,
        })
    }

    pub fn set_has_children(&mut self, id: NodeId, has_children: bool) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.has_children = has_children;
        }
    }

    /// Parent of `id`; `None` for the root and unknown ids.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id)?.parent
    }

    /// Current row number of `id` under its parent.
    pub fn row_of(&self, id: NodeId) -> Option<u32> {
        let parent = self.parent(id)?;
        self.children(parent)?
            .iter()
            .position(|&c| c == id)
            .map(|p| p as u32)
    }

    /// Current path of row `id` (column 0 at every step).
    pub fn path_of(&self, id: NodeId) -> Option<IndexPath> {
        let mut cells = Vec::new();
        let mut current = id;
        while current != self.root {
            let row = self.row_of(current)?;
            cells.push(repliq_protocol::Cell { row, column: 0 });
            current = self.parent(current)?;
        }
        cells.reverse();
        Some(IndexPath(cells))
    }

    /// Resolves a path to a row node. Column numbers select a cell within
    /// a row and are ignored here.
    pub fn node_at(&self, path: &IndexPath) -> Option<NodeId> {
        path.0
            .iter()
            .try_fold(self.root, |node, cell| self.child(node, cell.row))
    }

    /// Inserts rows `first..=last` under `parent`. `None` if the children
    /// of `parent` are unknown or `first` is out of range.
    pub fn insert_rows(&mut self, parent: NodeId, first: u32, last: u32) -> Option<Vec<NodeId>> {
        let len = self.children(parent)?.len();
        if first as usize > len || last < first {
            return None;
        }
        let fresh: Vec<NodeId> = (first..=last).map(|_| self.fresh(parent)).collect();
        let node = self.nodes.get_mut(&parent)?;
        let children = node.children.as_mut()?;
        children.splice(first as usize..first as usize, fresh.iter().copied());
        node.has_children = true;
        Some(fresh)
    }

    /// Removes rows `first..=last` under `parent`, returning every dropped
    /// id (descendants included). `None` if the children of `parent` are
    /// unknown or the range is out of bounds.
    pub fn remove_rows(&mut self, parent: NodeId, first: u32, last: u32) -> Option<Vec<NodeId>> {
        let node = self.nodes.get_mut(&parent)?;
        let children = node.children.as_mut()?;
        if last < first || last as usize >= children.len() {
            return None;
        }
        let removed: Vec<NodeId> = children.drain(first as usize..=last as usize).collect();
        node.has_children = !children.is_empty();
        let mut dropped = Vec::new();
        for id in removed {
            self.drop_subtree(id, &mut dropped);
        }
        Some(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(rows: u32) -> NodeTree {
        let mut t = NodeTree::new();
        t.reset(rows, 1);
        t
    }

    #[test]
    fn test_reset_creates_root_rows() {
        let t = tree(3);
        assert_eq!(t.row_count(t.root()), Some(3));
        assert_eq!(t.column_count(t.root()), 1);
        assert_eq!(t.len(), 4);
        let first = t.child(t.root(), 0).unwrap();
        assert_eq!(t.row_of(first), Some(0));
        assert_eq!(t.parent(first), Some(t.root()));
        assert_eq!(t.row_count(first), None);
    }

    #[test]
    fn test_remove_then_insert_keeps_ids_of_trailing_rows() {
        let mut t = tree(10);
        let root = t.root();
        let trailing: Vec<NodeId> = (5..10).map(|r| t.child(root, r).unwrap()).collect();

        let dropped = t.remove_rows(root, 2, 4).unwrap();
        assert_eq!(dropped.len(), 3);
        let fresh = t.insert_rows(root, 2, 3).unwrap();
        assert_eq!(fresh.len(), 2);

        for (offset, id) in trailing.iter().enumerate() {
            assert_eq!(t.row_of(*id), Some(4 + offset as u32));
        }
        assert_eq!(t.row_count(root), Some(9));
    }

    #[test]
    fn test_remove_rows_drops_descendants() {
        let mut t = tree(2);
        let root = t.root();
        let parent = t.child(root, 1).unwrap();
        t.set_children(parent, 3, 1);
        let grandchild = t.child(parent, 2).unwrap();

        let dropped = t.remove_rows(root, 1, 1).unwrap();
        assert_eq!(dropped.len(), 4);
        assert!(!t.contains(grandchild));
        assert!(!t.contains(parent));
    }

    #[test]
    fn test_insert_into_unknown_children_is_ignored() {
        let mut t = tree(1);
        let row = t.child(t.root(), 0).unwrap();
        assert_eq!(t.insert_rows(row, 0, 0), None);
        assert_eq!(t.insert_rows(t.root(), 5, 5), None);
        assert_eq!(t.remove_rows(t.root(), 0, 3), None);
    }

    #[test]
    fn test_path_round_trip() {
        let mut t = tree(3);
        let parent = t.child(t.root(), 2).unwrap();
        t.set_children(parent, 2, 4);
        let leaf = t.child(parent, 1).unwrap();

        let path = t.path_of(leaf).unwrap();
        assert_eq!(path, IndexPath::root().child(2, 0).child(1, 0));
        assert_eq!(t.node_at(&path), Some(leaf));
        assert_eq!(t.node_at(&IndexPath::root().child(2, 3).child(1, 2)), Some(leaf));
        assert_eq!(t.node_at(&IndexPath::root()), Some(t.root()));
        assert_eq!(t.node_at(&IndexPath::root().child(9, 0)), None);
    }

    #[test]
    fn test_has_children_uses_hint_until_known() {
        let mut t = tree(1);
        let row = t.child(t.root(), 0).unwrap();
        assert!(!t.has_children(row));
        t.set_has_children(row, true);
        assert!(t.has_children(row));
        t.set_children(row, 0, 1);
        assert!(!t.has_children(row));
    }
}
