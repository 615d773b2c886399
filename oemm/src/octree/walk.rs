//! Depth-first traversal shared by every pipeline pass

use super::{NodeId, Octree};
use crate::error::Error;

/// Kind of traversal event handed to a [`Visitor`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Visit {
    /// An internal node, before its children
    Preorder,
    /// An internal node, after its children
    Postorder,
    /// A leaf
    Leaf,
}

/// Visitor's verdict after each event
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Flow {
    /// Continue the traversal
    Ok,
    /// Do not descend below this node; its `Postorder` event is still
    /// delivered immediately
    SkipChildren,
    /// Stop the whole traversal
    Abort,
}

/// Callback invoked for every traversal event
///
/// `octant` is the node's position among its siblings (0 for the root).
/// The visitor receives the tree mutably so passes can update per-node
/// counters in place.
pub trait Visitor {
    fn visit(
        &mut self,
        tree: &mut Octree,
        node: NodeId,
        octant: usize,
        visit: Visit,
    ) -> Result<Flow, Error>;
}

/// What to do after a node's entry events have been delivered
enum Enter {
    Descend,
    Done,
    Abort,
}

impl Octree {
    /// Walks the tree depth-first with an explicit stack, delivering
    /// `Preorder`/`Postorder` events for internal nodes and `Leaf` events
    /// for leaves, children in octant order
    ///
    /// Returns `Ok(false)` if the visitor aborted.
    pub fn walk<V: Visitor>(&mut self, visitor: &mut V) -> Result<bool, Error> {
        let root = self.root();
        match self.enter(visitor, root, 0)? {
            Enter::Abort => return Ok(false),
            Enter::Done => return Ok(true),
            Enter::Descend => (),
        }
        // (node, octant, next child slot to examine)
        let mut stack: Vec<(NodeId, usize, usize)> = vec![(root, 0, 0)];
        while let Some(top) = stack.last_mut() {
            let (node, octant, next) = *top;
            if next == 8 {
                stack.pop();
                if let Flow::Abort = visitor.visit(self, node, octant, Visit::Postorder)? {
                    return Ok(false);
                }
                continue;
            }
            top.2 += 1;
            if let Some(child) = self.node(node).child(next) {
                match self.enter(visitor, child, next)? {
                    Enter::Abort => return Ok(false),
                    Enter::Done => (),
                    Enter::Descend => stack.push((child, next, 0)),
                }
            }
        }
        Ok(true)
    }

    fn enter<V: Visitor>(
        &mut self,
        visitor: &mut V,
        node: NodeId,
        octant: usize,
    ) -> Result<Enter, Error> {
        if self.node(node).is_leaf {
            return match visitor.visit(self, node, octant, Visit::Leaf)? {
                Flow::Abort => Ok(Enter::Abort),
                _ => Ok(Enter::Done),
            };
        }
        match visitor.visit(self, node, octant, Visit::Preorder)? {
            Flow::Abort => Ok(Enter::Abort),
            Flow::Ok => Ok(Enter::Descend),
            Flow::SkipChildren => match visitor.visit(self, node, octant, Visit::Postorder)? {
                Flow::Abort => Ok(Enter::Abort),
                _ => Ok(Enter::Done),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::octree::GRID_SIZE;
    use nalgebra::Vector3;

    struct Recorder {
        events: Vec<(Visit, i32)>,
        skip_size: Option<i32>,
        abort_after: Option<usize>,
    }

    impl Visitor for Recorder {
        fn visit(
            &mut self,
            tree: &mut Octree,
            node: NodeId,
            _octant: usize,
            visit: Visit,
        ) -> Result<Flow, Error> {
            let size = tree.node(node).size;
            self.events.push((visit, size));
            if let Some(limit) = self.abort_after {
                if self.events.len() >= limit {
                    return Ok(Flow::Abort);
                }
            }
            if visit == Visit::Preorder && self.skip_size == Some(size) {
                return Ok(Flow::SkipChildren);
            }
            Ok(Flow::Ok)
        }
    }

    fn two_level_tree() -> Octree {
        let mut t = Octree::with_bounds(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), 2);
        let s = t.smallest_size();
        t.build([0, 0, 0]).unwrap();
        t.build([s, 0, 0]).unwrap();
        t.build([GRID_SIZE - 1; 3]).unwrap();
        t
    }

    #[test]
    fn events_nest_properly() {
        let mut t = two_level_tree();
        let mut r = Recorder {
            events: Vec::new(),
            skip_size: None,
            abort_after: None,
        };
        assert!(t.walk(&mut r).unwrap());
        let half = GRID_SIZE / 2;
        assert_eq!(
            r.events,
            vec![
                (Visit::Preorder, GRID_SIZE),
                (Visit::Preorder, half),
                (Visit::Leaf, half / 2),
                (Visit::Leaf, half / 2),
                (Visit::Postorder, half),
                (Visit::Preorder, half),
                (Visit::Leaf, half / 2),
                (Visit::Postorder, half),
                (Visit::Postorder, GRID_SIZE),
            ]
        );
    }

    #[test]
    fn skip_children_still_closes_the_node() {
        let mut t = two_level_tree();
        let half = GRID_SIZE / 2;
        let mut r = Recorder {
            events: Vec::new(),
            skip_size: Some(half),
            abort_after: None,
        };
        assert!(t.walk(&mut r).unwrap());
        // half-size subtrees are skipped but their postorders still fire
        assert_eq!(
            r.events,
            vec![
                (Visit::Preorder, GRID_SIZE),
                (Visit::Preorder, half),
                (Visit::Postorder, half),
                (Visit::Preorder, half),
                (Visit::Postorder, half),
                (Visit::Postorder, GRID_SIZE),
            ]
        );
    }

    #[test]
    fn abort_stops_early() {
        let mut t = two_level_tree();
        let mut r = Recorder {
            events: Vec::new(),
            skip_size: None,
            abort_after: Some(3),
        };
        assert!(!t.walk(&mut r).unwrap());
        assert_eq!(r.events.len(), 3);
    }
}
