//! Octree over a fixed integer grid
//!
//! The octree covers a cube of `2^MAX_LEVEL` grid units per side.  Floating
//! point coordinates are snapped onto that grid once, when a mesh enters the
//! pipeline; every later comparison is exact integer arithmetic, so a vertex
//! shared between triangles lands on the same grid point in every pass.
//!
//! Nodes live in a flat arena and refer to each other through [`NodeId`]
//! handles.  A node of size `s` owns the half-open cube
//! `[ijk, ijk + s)` and its eight children split it in half along each
//! axis; bit 0 of a child octant selects the upper `x` half, bit 1 the
//! upper `y` half and bit 2 the upper `z` half.

mod walk;

pub use walk::{Flow, Visit, Visitor};

use crate::error::Error;
use nalgebra::Vector3;

/// Depth of the deepest possible octant
pub const MAX_LEVEL: u32 = 30;

/// Side of the integer grid, in grid units
pub const GRID_SIZE: i32 = 1 << MAX_LEVEL;

/// Sentinel for a leaf that has not been numbered yet
pub const NO_INDEX: u32 = u32::MAX;

/// Handle to a node inside an [`Octree`] arena
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Single octant of the tree
#[derive(Debug)]
pub struct Node {
    /// Side of the octant, in grid units (always a power of two)
    pub size: i32,
    /// Lower corner, in grid units
    pub ijk: [i32; 3],
    /// `true` once this node stores data instead of children
    pub is_leaf: bool,
    /// Triangles assigned to this octant
    pub tn: u32,
    /// Vertices owned by this octant
    pub vn: u32,
    /// Position of this leaf in the traversal order, or [`NO_INDEX`]
    pub leaf_index: u32,
    /// First global vertex label reserved for this leaf
    pub min_index: u32,
    /// Last global vertex label reserved for this leaf
    pub max_index: u32,
    /// Leaf indices of octants sharing at least one vertex with this one.
    /// Capped at 256 entries so adjacency files can store byte offsets.
    pub adjacent: Vec<u32>,
    /// Relative file stem of this leaf below the storage directory
    pub path: String,
    /// Byte offset of this leaf's region in the dispatched data file
    pub counter: u64,
    parent: Option<NodeId>,
    children: [Option<NodeId>; 8],
}

impl Node {
    fn new(size: i32, ijk: [i32; 3], parent: Option<NodeId>, is_leaf: bool) -> Self {
        Self {
            size,
            ijk,
            is_leaf,
            tn: 0,
            vn: 0,
            leaf_index: NO_INDEX,
            min_index: 0,
            max_index: 0,
            adjacent: Vec::new(),
            path: String::new(),
            counter: 0,
            parent,
            children: [None; 8],
        }
    }

    /// Checks whether a grid point falls inside this octant
    pub fn contains(&self, ijk: [i32; 3]) -> bool {
        (0..3).all(|a| ijk[a] >= self.ijk[a] && ijk[a] < self.ijk[a] + self.size)
    }

    /// Child octant on the given side, if it exists
    pub fn child(&self, octant: usize) -> Option<NodeId> {
        self.children[octant]
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
}

/// Picks the child octant of a node with children of side `size` which
/// contains the grid point
fn child_octant(size: i32, ijk: [i32; 3]) -> usize {
    let mut r = 0;
    for a in 0..3 {
        if ijk[a] & size != 0 {
            r |= 1 << a;
        }
    }
    r
}

/// Octree whose leaves partition a cubic domain
pub struct Octree {
    nodes: Vec<Node>,
    /// Leaves in traversal order, rebuilt by [`Octree::assign_leaf_indices`]
    leaves: Vec<NodeId>,
    /// Depth at which [`Octree::build`] creates leaves
    level: u32,
    /// Lower corner of the domain in world coordinates
    pub origin: Vector3<f64>,
    /// Grid units per world unit
    pub scale: f64,
}

impl Octree {
    /// Builds an empty tree over the axis-aligned box `[pmin, pmax]`
    ///
    /// `level` is the depth at which [`Octree::build`] creates leaves;
    /// level 0 makes the root the only possible leaf.  The largest extent
    /// of the box is stretched by a hair so that points exactly on the
    /// upper faces still quantize inside the grid.
    pub fn with_bounds(pmin: Vector3<f64>, pmax: Vector3<f64>, level: u32) -> Self {
        let delta = (pmax - pmin).max().max(f64::MIN_POSITIVE);
        let scale = GRID_SIZE as f64 * (1.0 - 1e-9) / delta;
        Self::from_raw(pmin, scale, level)
    }

    /// Rebuilds a tree shell from stored quantization parameters
    pub fn from_raw(origin: Vector3<f64>, scale: f64, level: u32) -> Self {
        let level = level.min(MAX_LEVEL);
        let root = Node::new(GRID_SIZE, [0; 3], None, level == 0);
        Self {
            nodes: vec![root],
            leaves: Vec::new(),
            level,
            origin,
            scale,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Side of the leaves created by [`Octree::build`]
    pub fn smallest_size(&self) -> i32 {
        GRID_SIZE >> self.level
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Number of indexed leaves
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Leaf with the given traversal index
    pub fn leaf(&self, leaf_index: u32) -> NodeId {
        self.leaves[leaf_index as usize]
    }

    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.leaves.iter().copied()
    }

    /// Snaps a world-coordinate point onto the integer grid
    ///
    /// Rounds to the nearest grid point so that [`Octree::int2double`]
    /// followed by `double2int` is an exact round trip.  The result may
    /// lie outside the grid; check it with [`Octree::in_domain`] before
    /// use.
    pub fn double2int(&self, p: &Vector3<f64>) -> [i32; 3] {
        let mut out = [0; 3];
        for a in 0..3 {
            out[a] = ((p[a] - self.origin[a]) * self.scale).round() as i32;
        }
        out
    }

    /// World coordinates of a grid point
    pub fn int2double(&self, ijk: [i32; 3]) -> Vector3<f64> {
        Vector3::new(
            self.origin[0] + f64::from(ijk[0]) / self.scale,
            self.origin[1] + f64::from(ijk[1]) / self.scale,
            self.origin[2] + f64::from(ijk[2]) / self.scale,
        )
    }

    /// Checks that a grid point lies inside the domain cube
    pub fn in_domain(ijk: [i32; 3]) -> bool {
        ijk.iter().all(|&c| c >= 0 && c < GRID_SIZE)
    }

    /// Returns the leaf created at depth `level` which contains the grid
    /// point, adding octants along the way as needed
    pub fn build(&mut self, ijk: [i32; 3]) -> Result<NodeId, Error> {
        if !Self::in_domain(ijk) {
            return Err(Error::OutsideDomain);
        }
        self.descend_build(self.smallest_size(), ijk)
    }

    /// Returns the existing octant of side `size` covering the grid point,
    /// creating it and any missing ancestors
    pub(crate) fn build_sized(&mut self, size: i32, ijk: [i32; 3]) -> Result<NodeId, Error> {
        if !Self::in_domain(ijk) {
            return Err(Error::OutsideDomain);
        }
        self.descend_build(size, ijk)
    }

    fn descend_build(&mut self, size: i32, ijk: [i32; 3]) -> Result<NodeId, Error> {
        let mut current = self.root();
        let mut s = GRID_SIZE;
        while s > size {
            s >>= 1;
            if self.node(current).is_leaf {
                return Err(Error::BadFormat("octant overlaps an existing leaf"));
            }
            let octant = child_octant(s, ijk);
            current = match self.node(current).children[octant] {
                Some(c) => c,
                None => {
                    let corner = [
                        self.node(current).ijk[0] + if octant & 1 != 0 { s } else { 0 },
                        self.node(current).ijk[1] + if octant & 2 != 0 { s } else { 0 },
                        self.node(current).ijk[2] + if octant & 4 != 0 { s } else { 0 },
                    ];
                    let id = NodeId(self.nodes.len() as u32);
                    self.nodes.push(Node::new(s, corner, Some(current), s == size));
                    self.nodes[current.index()].children[octant] = Some(id);
                    id
                }
            };
        }
        Ok(current)
    }

    /// Finds the leaf containing a grid point without modifying the tree
    pub fn search(&self, ijk: [i32; 3]) -> Result<NodeId, Error> {
        if !Self::in_domain(ijk) {
            return Err(Error::OutsideDomain);
        }
        let mut current = self.root();
        let mut s = GRID_SIZE;
        while !self.node(current).is_leaf {
            s >>= 1;
            let octant = child_octant(s, ijk);
            current = self
                .node(current)
                .children[octant]
                .ok_or(Error::OctantNotFound)?;
        }
        Ok(current)
    }

    /// Finds the octant of the same size as `from` which contains the grid
    /// point, walking up to the common ancestor and back down
    ///
    /// Returns `None` when the point is off the grid or when no octant was
    /// ever built there.  The result can be larger than `from` when a leaf
    /// covers the whole area.
    pub fn search_adjacent(&self, from: NodeId, ijk: [i32; 3]) -> Option<NodeId> {
        if !Self::in_domain(ijk) {
            return None;
        }
        let size = self.node(from).size;
        let mut current = from;
        while !self.node(current).contains(ijk) {
            current = self.node(current).parent?;
        }
        let mut s = self.node(current).size;
        while s > size && !self.node(current).is_leaf {
            s >>= 1;
            let octant = child_octant(s, ijk);
            current = self.node(current).children[octant]?;
        }
        Some(current)
    }

    /// Turns an internal node into a leaf, detaching its children
    ///
    /// All children must themselves be leaves; the caller is responsible
    /// for having folded their counters into the parent beforehand.
    pub(crate) fn merge_children(&mut self, id: NodeId) {
        debug_assert!(self.nodes[id.index()]
            .children
            .iter()
            .flatten()
            .all(|&c| self.nodes[c.index()].is_leaf));
        let node = &mut self.nodes[id.index()];
        node.children = [None; 8];
        node.is_leaf = true;
    }

    /// Walks the tree, numbering leaves in traversal order and rebuilding
    /// the leaf table
    pub fn assign_leaf_indices(&mut self) -> Result<(), Error> {
        struct Indexer(Vec<NodeId>);
        impl Visitor for Indexer {
            fn visit(
                &mut self,
                tree: &mut Octree,
                node: NodeId,
                _octant: usize,
                visit: Visit,
            ) -> Result<Flow, Error> {
                if visit == Visit::Leaf {
                    tree.node_mut(node).leaf_index = self.0.len() as u32;
                    self.0.push(node);
                }
                Ok(Flow::Ok)
            }
        }
        let mut indexer = Indexer(Vec::new());
        self.walk(&mut indexer)?;
        self.leaves = indexer.0;
        Ok(())
    }

    /// Registers a loaded leaf under the given index
    pub(crate) fn register_leaf(&mut self, leaf_index: u32, id: NodeId) -> Result<(), Error> {
        if leaf_index as usize != self.leaves.len() {
            return Err(Error::BadFormat("leaves are out of order"));
        }
        if self.node(id).children.iter().any(|c| c.is_some()) {
            return Err(Error::BadFormat("leaf overlaps an existing octant"));
        }
        let node = self.node_mut(id);
        // a stored leaf may sit above the build level, including at the
        // root itself after a full merge
        node.is_leaf = true;
        node.leaf_index = leaf_index;
        self.leaves.push(id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tree() -> Octree {
        Octree::with_bounds(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), 3)
    }

    #[test]
    fn quantization_roundtrip() {
        let t = tree();
        let p = Vector3::new(0.25, 0.5, 0.99);
        let ijk = t.double2int(&p);
        assert!(Octree::in_domain(ijk));
        let q = t.int2double(ijk);
        for a in 0..3 {
            approx::assert_relative_eq!(p[a], q[a], epsilon = 1e-6);
        }
    }

    #[test]
    fn upper_corner_stays_in_domain() {
        let t = tree();
        let ijk = t.double2int(&Vector3::new(1.0, 1.0, 1.0));
        assert!(Octree::in_domain(ijk));
        assert!(!Octree::in_domain(t.double2int(&Vector3::new(1.5, 0.0, 0.0))));
        assert!(!Octree::in_domain(t.double2int(&Vector3::new(-0.1, 0.0, 0.0))));
    }

    #[test]
    fn build_creates_leaves_at_level() {
        let mut t = tree();
        let leaf = t.build([0, 0, 0]).unwrap();
        assert_eq!(t.node(leaf).size, GRID_SIZE >> 3);
        assert!(t.node(leaf).is_leaf);
        // same point maps to the same leaf
        assert_eq!(t.build([1, 2, 3]).unwrap(), leaf);
        // the opposite corner lives elsewhere
        let far = t.build([GRID_SIZE - 1; 3]).unwrap();
        assert_ne!(far, leaf);
        assert_eq!(t.search([0, 0, 0]).unwrap(), leaf);
        assert_eq!(t.search([GRID_SIZE - 1; 3]).unwrap(), far);
    }

    #[test]
    fn search_missing_octant() {
        let mut t = tree();
        t.build([0, 0, 0]).unwrap();
        assert!(matches!(
            t.search([GRID_SIZE - 1; 3]),
            Err(Error::OctantNotFound)
        ));
        assert!(matches!(t.search([-1, 0, 0]), Err(Error::OutsideDomain)));
    }

    #[test]
    fn level_zero_root_is_leaf() {
        let mut t = Octree::with_bounds(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), 0);
        let leaf = t.build([5, 5, 5]).unwrap();
        assert_eq!(leaf, t.root());
        assert_eq!(t.node(leaf).size, GRID_SIZE);
    }

    #[test]
    fn adjacent_search_crosses_octants() {
        let mut t = tree();
        let s = t.smallest_size();
        let a = t.build([0, 0, 0]).unwrap();
        let b = t.build([s, 0, 0]).unwrap();
        // one step past a's face in +x lands in b
        assert_eq!(t.search_adjacent(a, [s, 0, 0]), Some(b));
        // nothing was built two octants away
        assert_eq!(t.search_adjacent(a, [2 * s, 0, 0]), None);
        // off the grid entirely
        assert_eq!(t.search_adjacent(a, [-1, 0, 0]), None);
    }

    #[test]
    fn leaf_indices_follow_traversal_order() {
        let mut t = tree();
        let s = t.smallest_size();
        t.build([s, s, s]).unwrap();
        t.build([0, 0, 0]).unwrap();
        t.build([GRID_SIZE - 1; 3]).unwrap();
        t.assign_leaf_indices().unwrap();
        assert_eq!(t.leaf_count(), 3);
        // octant 0 before octant 7 regardless of insertion order
        assert_eq!(t.node(t.leaf(0)).ijk, [0, 0, 0]);
        assert_eq!(t.node(t.leaf(1)).ijk, [s, s, s]);
        for i in 0..3 {
            assert_eq!(t.node(t.leaf(i)).leaf_index, i);
        }
    }
}
