//! Revision trees stored as node arenas.
//!
//! Nodes refer to each other by index: a directory maps child names to
//! indices and every node records its parent's index. Removing a child only
//! unlinks it; [`Tree::compact`] drops unreachable nodes before a tree is
//! published.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{NodeKind, PropertyList};

/// Index of a node inside one [`Tree`].
pub(crate) type NodeId = usize;

#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) kind: NodeKind,
    pub(crate) props: PropertyList,
    pub(crate) contents: Arc<Vec<u8>>,
    pub(crate) children: BTreeMap<String, NodeId>,
    pub(crate) created_rev: u64,
}

impl Node {
    fn new(name: &str, parent: Option<NodeId>, kind: NodeKind, created_rev: u64) -> Self {
        Self {
            name: name.to_string(),
            parent,
            kind,
            props: PropertyList::new(),
            contents: Arc::new(Vec::new()),
            children: BTreeMap::new(),
            created_rev,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub(crate) const ROOT: NodeId = 0;

    /// A tree holding only an empty root directory.
    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![Node::new("", None, NodeKind::Dir, 0)],
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<NodeId> {
        let mut id = Self::ROOT;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            id = *self.nodes[id].children.get(name)?;
        }
        Some(id)
    }

    pub(crate) fn kind_at(&self, path: &str) -> NodeKind {
        self.lookup(path)
            .map_or(NodeKind::None, |id| self.nodes[id].kind)
    }

    pub(crate) fn path_of(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut cur = Some(id);
        while let Some(i) = cur {
            let node = &self.nodes[i];
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            cur = node.parent;
        }
        names.reverse();
        names.join("/")
    }

    pub(crate) fn add_child(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        created_rev: u64,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes
            .push(Node::new(name, Some(parent), kind, created_rev));
        self.nodes[parent].children.insert(name.to_string(), id);
        id
    }

    pub(crate) fn remove_child(&mut self, parent: NodeId, name: &str) -> Option<NodeId> {
        let id = self.nodes[parent].children.remove(name)?;
        self.nodes[id].parent = None;
        Some(id)
    }

    /// Copies the subtree rooted at `src` of `from` under `parent` as `name`.
    pub(crate) fn copy_subtree(
        &mut self,
        from: &Tree,
        src: NodeId,
        parent: NodeId,
        name: &str,
    ) -> NodeId {
        let source = from.node(src);
        let id = self.add_child(parent, name, source.kind, source.created_rev);
        {
            let node = &mut self.nodes[id];
            node.props = source.props.clone();
            node.contents = Arc::clone(&source.contents);
        }
        let children: Vec<(String, NodeId)> = source
            .children
            .iter()
            .map(|(name, child)| (name.clone(), *child))
            .collect();
        for (child_name, child) in children {
            self.copy_subtree(from, child, id, &child_name);
        }
        id
    }

    /// Sets `created_rev` on `id` and all of its ancestors.
    pub(crate) fn bump(&mut self, id: NodeId, rev: u64) {
        let mut cur = Some(id);
        while let Some(i) = cur {
            self.nodes[i].created_rev = rev;
            cur = self.nodes[i].parent;
        }
    }

    /// Whether `id` is still reachable from the root.
    pub(crate) fn is_linked(&self, id: NodeId) -> bool {
        let mut cur = id;
        loop {
            if cur == Self::ROOT {
                return true;
            }
            match self.nodes[cur].parent {
                Some(parent) if self.nodes[parent].children.get(&self.nodes[cur].name) == Some(&cur) => {
                    cur = parent;
                }
                _ => return false,
            }
        }
    }

    /// Rebuilds the arena with only the nodes reachable from the root.
    pub(crate) fn compact(&self) -> Tree {
        let mut out = Tree {
            nodes: Vec::with_capacity(self.nodes.len()),
        };
        let mut root = self.nodes[Self::ROOT].clone();
        root.children.clear();
        out.nodes.push(root);
        let mut stack = vec![(Self::ROOT, Self::ROOT)];
        while let Some((old, new)) = stack.pop() {
            for (name, child) in &self.nodes[old].children {
                let mut node = self.nodes[*child].clone();
                node.parent = Some(new);
                node.children.clear();
                let id = out.nodes.len();
                out.nodes.push(node);
                out.nodes[new].children.insert(name.clone(), id);
                stack.push((*child, id));
            }
        }
        out
    }

    /// Structural equality of two subtrees, ignoring `created_rev`.
    pub(crate) fn same_subtree(&self, a: NodeId, other: &Tree, b: NodeId) -> bool {
        let (x, y) = (self.node(a), other.node(b));
        if x.kind != y.kind || x.props != y.props || x.contents != y.contents {
            return false;
        }
        if x.children.len() != y.children.len() {
            return false;
        }
        x.children.iter().all(|(name, child)| {
            y.children
                .get(name)
                .is_some_and(|other_child| self.same_subtree(*child, other, *other_child))
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn sample() -> Tree {
        let mut tree = Tree::new();
        let trunk = tree.add_child(Tree::ROOT, "trunk", NodeKind::Dir, 1);
        let file = tree.add_child(trunk, "a.txt", NodeKind::File, 1);
        tree.node_mut(file).contents = Arc::new(b"alpha".to_vec());
        tree.add_child(trunk, "sub", NodeKind::Dir, 1);
        tree
    }

    #[test]
    fn lookup_and_path_of_agree() {
        let tree = sample();
        let id = tree.lookup("trunk/a.txt").unwrap();
        assert_eq!(tree.path_of(id), "trunk/a.txt");
        assert_eq!(tree.lookup(""), Some(Tree::ROOT));
        assert_eq!(tree.path_of(Tree::ROOT), "");
        assert!(tree.lookup("trunk/missing").is_none());
        assert_eq!(tree.kind_at("trunk/sub"), NodeKind::Dir);
        assert_eq!(tree.kind_at("nope"), NodeKind::None);
    }

    #[test]
    fn copy_is_deep_and_independent() {
        let mut tree = sample();
        let from = tree.clone();
        let trunk = from.lookup("trunk").unwrap();
        tree.copy_subtree(&from, trunk, Tree::ROOT, "branch");
        let copied = tree.lookup("branch/a.txt").unwrap();
        assert_eq!(tree.node(copied).contents.as_slice(), b"alpha");
        assert!(tree.same_subtree(tree.lookup("branch").unwrap(), &from, trunk));

        tree.node_mut(copied).contents = Arc::new(b"beta".to_vec());
        let original = tree.lookup("trunk/a.txt").unwrap();
        assert_eq!(tree.node(original).contents.as_slice(), b"alpha");
    }

    #[test]
    fn compact_drops_removed_nodes() {
        let mut tree = sample();
        let trunk = tree.lookup("trunk").unwrap();
        let removed = tree.remove_child(trunk, "sub").unwrap();
        assert!(!tree.is_linked(removed));
        let compact = tree.compact();
        assert_eq!(compact.len(), 3);
        assert!(compact.lookup("trunk/sub").is_none());
        assert!(compact.lookup("trunk/a.txt").is_some());
    }

    #[test]
    fn bump_marks_ancestors() {
        let mut tree = sample();
        let file = tree.lookup("trunk/a.txt").unwrap();
        tree.bump(file, 7);
        assert_eq!(tree.node(file).created_rev, 7);
        assert_eq!(tree.node(tree.lookup("trunk").unwrap()).created_rev, 7);
        assert_eq!(tree.node(Tree::ROOT).created_rev, 7);
        assert_eq!(tree.node(tree.lookup("trunk/sub").unwrap()).created_rev, 1);
    }
}
