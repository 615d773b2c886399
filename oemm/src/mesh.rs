//! In-memory mesh slice loaded from a subset of leaves
//!
//! A [`Mesh`] is what an editor works on: plain vertex and triangle arrays
//! plus per-element flags telling which parts may be changed.  A vertex or
//! triangle is *writable* when everything it depends on was loaded, and
//! merely *readable* when it is a frozen copy of data owned by a leaf
//! outside the loaded set.

use nalgebra::Vector3;

/// Label of a vertex created in memory and not yet saved
pub const UNASSIGNED: u32 = u32::MAX;

/// One mesh vertex
#[derive(Clone, Debug)]
pub struct Vertex {
    /// Position in world coordinates
    pub pos: Vector3<f64>,
    /// Global label, or [`UNASSIGNED`] for a vertex added in memory
    pub label: u32,
    /// Leaf owning this vertex, or [`UNASSIGNED`] for a new vertex
    pub leaf: u32,
    /// Local index inside the owning leaf
    pub local: u32,
    /// Coordinates are valid (placeholders for unloaded leaves start
    /// without them)
    pub readable: bool,
    /// The vertex may be moved and will be written back on save
    pub writable: bool,
}

/// One mesh triangle, referring to vertices by position in the vertex array
#[derive(Clone, Debug)]
pub struct Triangle {
    /// Corner positions in [`Mesh::vertices`]
    pub v: [usize; 3],
    /// Application-defined group id, carried through unchanged
    pub group: i32,
    /// All three corners carry valid coordinates
    pub readable: bool,
    /// All three corners live in loaded leaves
    pub writable: bool,
}

/// Editable slice of an indexed mesh
#[derive(Default)]
pub struct Mesh {
    /// Vertex array, loaded vertices first
    pub vertices: Vec<Vertex>,
    /// Triangles indexing into [`Mesh::vertices`]
    pub triangles: Vec<Triangle>,
}

impl Mesh {
    /// Builds an empty mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a brand new vertex; it receives a label and an owning leaf
    /// when the mesh is saved
    pub fn add_vertex(&mut self, pos: Vector3<f64>) -> usize {
        self.vertices.push(Vertex {
            pos,
            label: UNASSIGNED,
            leaf: UNASSIGNED,
            local: 0,
            readable: true,
            writable: true,
        });
        self.vertices.len() - 1
    }

    /// Adds a triangle over existing vertices
    pub fn add_triangle(&mut self, v: [usize; 3], group: i32) -> usize {
        self.triangles.push(Triangle {
            v,
            group,
            readable: true,
            writable: true,
        });
        self.triangles.len() - 1
    }
}
