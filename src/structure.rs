// The recorded draw tree.
//
// One run of a generator produces an ordered tree: a leaf for every primitive
// integer draw, an interior node for every generator scope that was entered.
// The tree is immutable once built; shrinking replaces whole subtrees by
// path-copying from the changed node up to the root, sharing every untouched
// sibling through `Arc`.

use std::sync::Arc;

use rustc_hash::FxHasher;
use std::hash::Hasher;

use crate::distributions::IntDistribution;

/// Identity of one logical draw site, stable across replacement copies of a
/// tree. Ids are assigned in preorder by one generation session, so a child's
/// id is always greater than its parent's and than every id assigned earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

/// One element of the draw tree. Exactly two shapes exist; the shrink engine's
/// exhaustive handling depends on that.
#[derive(Debug, Clone)]
pub enum StructureElement {
    Int(IntData),
    Node(StructureNode),
}

/// A recorded primitive draw: the value it produced and the distribution that
/// produced it. The distribution is kept so that shrink candidates for this
/// site can be validated before replay.
#[derive(Debug, Clone)]
pub struct IntData {
    pub id: NodeId,
    pub value: i64,
    pub distribution: IntDistribution,
}

/// An interior node: the draws performed, in order, by the generator code that
/// ran inside this node's scope.
#[derive(Debug, Clone)]
pub struct StructureNode {
    pub id: NodeId,
    /// When set, the shrink engine skips this node and its whole subtree.
    pub shrink_prohibited: bool,
    pub children: Vec<Arc<StructureElement>>,
}

impl StructureElement {
    pub fn id(&self) -> NodeId {
        match self {
            StructureElement::Int(leaf) => leaf.id,
            StructureElement::Node(node) => node.id,
        }
    }

    /// Recursive structural hash: a leaf hashes to its value, a node combines
    /// its children's hashes. Used only to deduplicate already-tried trees.
    pub fn structural_hash(&self) -> u64 {
        match self {
            StructureElement::Int(leaf) => leaf.value as u64,
            StructureElement::Node(node) => node.structural_hash(),
        }
    }

    /// Total element count of this subtree, the leaf or node itself included.
    pub fn size(&self) -> usize {
        match self {
            StructureElement::Int(_) => 1,
            StructureElement::Node(node) => {
                1 + node.children.iter().map(|child| child.size()).sum::<usize>()
            }
        }
    }
}

impl StructureNode {
    pub fn new(id: NodeId) -> StructureNode {
        StructureNode {
            id,
            shrink_prohibited: false,
            children: Vec::new(),
        }
    }

    pub fn structural_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for child in &self.children {
            hasher.write_u64(child.structural_hash());
        }
        hasher.finish()
    }

    /// Total element count of the tree rooted here, this node included.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(|child| child.size()).sum::<usize>()
    }

    /// Find the element with the given id below this node. Preorder id
    /// assignment means the subtree containing `id` is rooted at the last
    /// child whose own id does not exceed it.
    pub fn find(&self, id: NodeId) -> Option<&Arc<StructureElement>> {
        let index = self.children.iter().rposition(|child| child.id() <= id)?;
        let child = &self.children[index];
        if child.id() == id {
            return Some(child);
        }
        match &**child {
            StructureElement::Node(node) => node.find(id),
            StructureElement::Int(_) => None,
        }
    }

    /// Replace the subtree identified by `id` with `replacement`, producing a
    /// new root. Only the nodes on the path from the replaced element to this
    /// node are copied; all other subtrees are shared with the original.
    pub fn replace(
        &self,
        id: NodeId,
        replacement: StructureElement,
    ) -> Option<StructureNode> {
        let index = self.children.iter().rposition(|child| child.id() <= id)?;
        let mut children = self.children.clone();
        if self.children[index].id() == id {
            children[index] = Arc::new(replacement);
        } else {
            let StructureElement::Node(inner) = &*self.children[index] else {
                return None;
            };
            let rebuilt = inner.replace(id, replacement)?;
            children[index] = Arc::new(StructureElement::Node(rebuilt));
        }
        Some(StructureNode {
            id: self.id,
            shrink_prohibited: self.shrink_prohibited,
            children,
        })
    }

    /// When this node represents a sequence, its leading length counter.
    ///
    /// The convention: the first child is a leaf whose value equals the number
    /// of remaining children, and every remaining child is a node. This is how
    /// the shrink engine recognizes "this subtree is a list" without any type
    /// information.
    pub fn list_length_counter(&self) -> Option<&IntData> {
        let first = self.children.first()?;
        let StructureElement::Int(counter) = &**first else {
            return None;
        };
        if counter.value != (self.children.len() - 1) as i64 {
            return None;
        }
        let all_nodes = self.children[1..]
            .iter()
            .all(|child| matches!(&**child, StructureElement::Node(_)));
        if all_nodes {
            Some(counter)
        } else {
            None
        }
    }

    pub fn is_list_shaped(&self) -> bool {
        self.list_length_counter().is_some()
    }
}
