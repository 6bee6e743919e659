//! Persistent external tree: the document structure the rule engine
//! builds as it drives tokens through a rulebook.
//!
//! Nodes are fixed-size records in a [`FixedPool`], atom-addressed like
//! everything else in this crate. Children are linked in document order
//! via a `first_child`/`last_child` pair on the parent (O(1) append) and
//! a `next_sibling` pointer on each child, the same intrusive-list shape
//! the fixed pool itself uses for its free list.

use crate::atom::{atom_from_raw, atom_to_raw, Atom};
use crate::error::Result;
use crate::pool::FixedPool;
use crate::segment::Segment;

/// The kind of markup a node was created from. Matches the token types
/// a rule's `save` action can act on, plus attribute/namespace nodes
/// hung off an element rather than appearing as siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Text = 0,
    Open = 1,
    Close = 2,
    Empty = 3,
    Pi = 4,
    Comment = 5,
    Attribute = 6,
    Namespace = 7,
}

impl NodeType {
    fn from_u8(v: u8) -> NodeType {
        match v {
            0 => NodeType::Text,
            1 => NodeType::Open,
            2 => NodeType::Close,
            3 => NodeType::Empty,
            4 => NodeType::Pi,
            5 => NodeType::Comment,
            6 => NodeType::Attribute,
            _ => NodeType::Namespace,
        }
    }
}

#[repr(C)]
struct NodeRecord {
    node_type: u8,
    _pad: [u8; 3],
    name: u32,
    namespace: u32,
    parent: u32,
    depth: u32,
    next_sibling: u32,
    first_child: u32,
    last_child: u32,
    /// An immutable-string atom for `Text`/`Attribute` nodes; unused
    /// (left null) for nodes whose content is their child list.
    content: u32,
}

const NODE_RECORD_SIZE: u32 = std::mem::size_of::<NodeRecord>() as u32;

pub struct Tree<'seg> {
    nodes: FixedPool<'seg>,
}

impl<'seg> Tree<'seg> {
    pub fn open(segment: &'seg Segment, name: &str, max_atoms: u32, flags: u8) -> Result<Tree<'seg>> {
        let nodes = FixedPool::open(segment, &format!("{name}.nodes"), 6, NODE_RECORD_SIZE, max_atoms, flags | crate::pool::INIT_ZERO)?;
        Ok(Tree { nodes })
    }

    fn node(&self, atom: Atom) -> &NodeRecord {
        self.nodes.addr(atom).expect("tree atom must resolve").transmute_page::<NodeRecord>()
    }

    #[allow(clippy::mut_from_ref)]
    fn node_mut(&self, atom: Atom) -> &mut NodeRecord {
        self.nodes.addr_mut(atom).expect("tree atom must resolve").transmute_page_mut::<NodeRecord>()
    }

    /// Create a new node under `parent` (null for a root), appended after
    /// any existing children — `save` actions always build in document
    /// order, so this is the only insertion the tree needs to support.
    pub fn create(&self, node_type: NodeType, name: Atom, namespace: Atom, parent: Atom) -> Result<Atom> {
        let atom = self.nodes.alloc()?;
        let depth = match parent {
            Some(_) => self.node(parent).depth + 1,
            None => 0,
        };
        {
            let rec = self.node_mut(atom);
            rec.node_type = node_type as u8;
            rec._pad = [0; 3];
            rec.name = atom_to_raw(name);
            rec.namespace = atom_to_raw(namespace);
            rec.parent = atom_to_raw(parent);
            rec.depth = depth;
            rec.next_sibling = 0;
            rec.first_child = 0;
            rec.last_child = 0;
            rec.content = 0;
        }
        if parent.is_some() {
            let last = self.node(parent).last_child;
            if last == 0 {
                self.node_mut(parent).first_child = atom_to_raw(atom);
            } else {
                self.node_mut(atom_from_raw(last)).next_sibling = atom_to_raw(atom);
            }
            self.node_mut(parent).last_child = atom_to_raw(atom);
        }
        Ok(atom)
    }

    /// Attach a content atom (an interned string) to `node` — used for
    /// `Text` nodes and for `save-simple`'s inline attribute strings.
    pub fn set_content(&self, node: Atom, content: Atom) {
        self.node_mut(node).content = atom_to_raw(content);
    }

    pub fn node_type(&self, node: Atom) -> NodeType {
        NodeType::from_u8(self.node(node).node_type)
    }

    pub fn name(&self, node: Atom) -> Atom {
        atom_from_raw(self.node(node).name)
    }

    pub fn namespace(&self, node: Atom) -> Atom {
        atom_from_raw(self.node(node).namespace)
    }

    pub fn parent(&self, node: Atom) -> Atom {
        atom_from_raw(self.node(node).parent)
    }

    pub fn depth(&self, node: Atom) -> u32 {
        self.node(node).depth
    }

    pub fn first_child(&self, node: Atom) -> Atom {
        atom_from_raw(self.node(node).first_child)
    }

    pub fn next_sibling(&self, node: Atom) -> Atom {
        atom_from_raw(self.node(node).next_sibling)
    }

    pub fn content(&self, node: Atom) -> Atom {
        atom_from_raw(self.node(node).content)
    }

    /// Children of `node`, in document order.
    pub fn children(&self, node: Atom) -> Vec<Atom> {
        let mut out = Vec::new();
        let mut cur = self.first_child(node);
        while let Some(c) = cur {
            out.push(Some(c));
            cur = self.next_sibling(Some(c));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strtab::ImmutableStringTable;
    use tempfile::NamedTempFile;

    #[test]
    fn root_node_has_depth_zero_and_no_parent() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let tree = Tree::open(&seg, "t", 64, 0).unwrap();
        let root = tree.create(NodeType::Open, None, None, None).unwrap();
        assert_eq!(tree.depth(root), 0);
        assert_eq!(tree.parent(root), None);
        assert!(tree.children(root).is_empty());
    }

    #[test]
    fn children_are_recorded_in_document_order() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let tree = Tree::open(&seg, "t", 64, 0).unwrap();
        let strings = ImmutableStringTable::open(&seg, "s", 16, 64, 0).unwrap();

        let doc = tree.create(NodeType::Open, strings.intern(b"doc\0").unwrap(), None, None).unwrap();
        let p = tree.create(NodeType::Open, strings.intern(b"p\0").unwrap(), None, doc).unwrap();
        let q = tree.create(NodeType::Open, strings.intern(b"q\0").unwrap(), None, doc).unwrap();

        assert_eq!(tree.children(doc), vec![p, q]);
        assert_eq!(tree.parent(p), doc);
        assert_eq!(tree.depth(p), 1);
    }

    #[test]
    fn text_node_carries_a_content_atom() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let tree = Tree::open(&seg, "t", 64, 0).unwrap();
        let strings = ImmutableStringTable::open(&seg, "s", 16, 64, 0).unwrap();

        let p = tree.create(NodeType::Open, strings.intern(b"p\0").unwrap(), None, None).unwrap();
        let text = tree.create(NodeType::Text, None, None, p).unwrap();
        let content = strings.intern(b"hi").unwrap();
        tree.set_content(text, content);
        assert_eq!(tree.content(text), content);
        assert_eq!(tree.node_type(text), NodeType::Text);
    }
}
