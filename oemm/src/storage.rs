//! Final on-disk layout of an indexed mesh
//!
//! An indexed mesh is a directory tree mirroring the octree: each leaf owns
//! a file stem named after its path of octants (`"3/0/5"`), with four files
//! per leaf:
//!
//! * `…v` holds the owned vertices, three little-endian `f64` per vertex,
//!   in local-index order
//! * `…a` holds the adjacency, one row per vertex: a count byte followed
//!   by that many byte offsets into the leaf's adjacency table
//! * `…t` holds the triangles owned by the leaf, 28 bytes each: three
//!   `(leaf index, local index)` pairs and a group id
//! * `…h` is the leaf header: geometry, counters, reserved label range and
//!   the adjacency table itself
//!
//! A single versioned `octree` file at the top records the quantization
//! parameters and the leaf paths, which is all that is needed to rebuild
//! the octree shell without touching any leaf.

use crate::error::Error;
use crate::octree::Octree;
use crate::soup::read_full;
use arrayvec::ArrayVec;
use nalgebra::Vector3;
use static_assertions::const_assert_eq;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use zerocopy::byteorder::little_endian::{F64, I32, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Name of the top-level structure file inside a storage directory
pub const STRUCTURE_FILE: &str = "octree";

const STRUCTURE_VERSION: u32 = 1;

/// On-disk size of one final vertex
pub(crate) const VERTEX_SIZE: usize = 24;

/// On-disk size of one grid-coordinate vertex (before conversion)
pub(crate) const INT_VERTEX_SIZE: usize = 12;

/// On-disk size of one triangle
pub(crate) const TRIANGLE_SIZE: usize = 28;

/// Bytes of a triangle record holding the vertex references; patching
/// rewrites exactly this prefix
pub(crate) const TRIANGLE_REF_SIZE: usize = 24;

/// Vertex in grid coordinates, the working format between index passes
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct IntVertexRecord {
    ijk: [I32; 3],
}

const_assert_eq!(std::mem::size_of::<IntVertexRecord>(), INT_VERTEX_SIZE);

impl IntVertexRecord {
    pub(crate) fn new(ijk: [i32; 3]) -> Self {
        Self {
            ijk: ijk.map(I32::new),
        }
    }

    pub(crate) fn get(&self) -> [i32; 3] {
        self.ijk.map(|c| c.get())
    }
}

/// Vertex in world coordinates, the final format
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct VertexRecord {
    xyz: [F64; 3],
}

const_assert_eq!(std::mem::size_of::<VertexRecord>(), VERTEX_SIZE);

impl VertexRecord {
    pub(crate) fn new(p: &Vector3<f64>) -> Self {
        Self {
            xyz: [F64::new(p[0]), F64::new(p[1]), F64::new(p[2])],
        }
    }

    pub(crate) fn get(&self) -> Vector3<f64> {
        Vector3::new(self.xyz[0].get(), self.xyz[1].get(), self.xyz[2].get())
    }
}

/// Triangle as three `(leaf, local)` vertex references plus a group id
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct TriangleRecord {
    leaf: [U32; 3],
    vert: [U32; 3],
    group: I32,
}

const_assert_eq!(std::mem::size_of::<TriangleRecord>(), TRIANGLE_SIZE);

impl TriangleRecord {
    pub(crate) fn new(leaf: [u32; 3], vert: [u32; 3], group: i32) -> Self {
        Self {
            leaf: leaf.map(U32::new),
            vert: vert.map(U32::new),
            group: I32::new(group),
        }
    }

    pub(crate) fn leaf(&self, i: usize) -> u32 {
        self.leaf[i].get()
    }

    pub(crate) fn vert(&self, i: usize) -> u32 {
        self.vert[i].get()
    }

    pub(crate) fn set_ref(&mut self, i: usize, leaf: u32, vert: u32) {
        self.leaf[i] = U32::new(leaf);
        self.vert[i] = U32::new(vert);
    }

    pub(crate) fn group(&self) -> i32 {
        self.group.get()
    }

    /// The reference prefix, without the group id
    pub(crate) fn ref_bytes(&self) -> &[u8] {
        &self.as_bytes()[..TRIANGLE_REF_SIZE]
    }
}

#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct StructureHeader {
    version: U32,
    level: U32,
    nr_leaves: U32,
    _pad: U32,
    origin: [F64; 3],
    scale: F64,
}

#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct LeafHeader {
    leaf_index: U32,
    size: I32,
    ijk: [I32; 3],
    vn: U32,
    tn: U32,
    min_index: U32,
    max_index: U32,
    nr_adjacent: U32,
}

/// Resolves a leaf data file below `dir`: the last path segment gets the
/// one-letter suffix appended
pub(crate) fn leaf_file(dir: &Path, node_path: &str, suffix: char) -> PathBuf {
    let mut out = dir.to_path_buf();
    let mut parts = node_path.split('/').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_some() {
            out.push(part);
        } else {
            out.push(format!("{part}{suffix}"));
        }
    }
    out
}

/// Creates the directories a leaf's files live in
pub(crate) fn create_leaf_dirs(dir: &Path, node_path: &str) -> Result<(), Error> {
    if let Some(parent) = leaf_file(dir, node_path, 'h').parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes the header file of one leaf
pub(crate) fn write_leaf_header(dir: &Path, tree: &Octree, leaf_index: u32) -> Result<(), Error> {
    let node = tree.node(tree.leaf(leaf_index));
    let mut out = BufWriter::new(File::create(leaf_file(dir, &node.path, 'h'))?);
    let header = LeafHeader {
        leaf_index: U32::new(node.leaf_index),
        size: I32::new(node.size),
        ijk: node.ijk.map(I32::new),
        vn: U32::new(node.vn),
        tn: U32::new(node.tn),
        min_index: U32::new(node.min_index),
        max_index: U32::new(node.max_index),
        nr_adjacent: U32::new(node.adjacent.len() as u32),
    };
    out.write_all(header.as_bytes())?;
    for &adj in &node.adjacent {
        out.write_all(U32::new(adj).as_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// Writes the top-level structure file for an indexed octree
pub fn write_structure(dir: &Path, tree: &Octree) -> Result<(), Error> {
    let mut out = BufWriter::new(File::create(dir.join(STRUCTURE_FILE))?);
    let header = StructureHeader {
        version: U32::new(STRUCTURE_VERSION),
        level: U32::new(tree.level()),
        nr_leaves: U32::new(tree.leaf_count() as u32),
        _pad: U32::new(0),
        origin: [
            F64::new(tree.origin[0]),
            F64::new(tree.origin[1]),
            F64::new(tree.origin[2]),
        ],
        scale: F64::new(tree.scale),
    };
    out.write_all(header.as_bytes())?;
    for id in tree.leaves() {
        let path = tree.node(id).path.as_bytes();
        out.write_all(U16::new(path.len() as u16).as_bytes())?;
        out.write_all(path)?;
    }
    out.flush()?;
    Ok(())
}

/// Rebuilds an octree from a storage directory written by the indexer
///
/// Only the structure file and the leaf headers are touched; vertex and
/// triangle data stay on disk until a reader asks for them.
pub fn read_structure(dir: &Path) -> Result<Octree, Error> {
    let mut inp = BufReader::new(File::open(dir.join(STRUCTURE_FILE))?);
    let mut buf = [0u8; std::mem::size_of::<StructureHeader>()];
    inp.read_exact(&mut buf)?;
    let header = StructureHeader::read_from_bytes(&buf)
        .map_err(|_| Error::BadFormat("bad structure header"))?;
    if header.version.get() != STRUCTURE_VERSION {
        return Err(Error::BadVersion(header.version.get()));
    }
    let origin = Vector3::new(
        header.origin[0].get(),
        header.origin[1].get(),
        header.origin[2].get(),
    );
    let mut tree = Octree::from_raw(origin, header.scale.get(), header.level.get());
    for i in 0..header.nr_leaves.get() {
        let mut len = [0u8; 2];
        inp.read_exact(&mut len)?;
        let mut path = vec![0u8; u16::from_le_bytes(len) as usize];
        inp.read_exact(&mut path)?;
        let path =
            String::from_utf8(path).map_err(|_| Error::BadFormat("bad leaf path"))?;
        let leaf = read_leaf_header(dir, &path)?;
        if leaf.leaf_index.get() != i {
            return Err(Error::BadFormat("leaf header index does not match"));
        }
        let id = tree.build_sized(leaf.size.get(), leaf.ijk.map(|c| c.get()))?;
        let node = tree.node_mut(id);
        node.vn = leaf.vn.get();
        node.tn = leaf.tn.get();
        node.min_index = leaf.min_index.get();
        node.max_index = leaf.max_index.get();
        node.adjacent = leaf.adjacent;
        node.path = path;
        tree.register_leaf(i, id)?;
    }
    Ok(tree)
}

struct LeafInfo {
    leaf_index: U32,
    size: I32,
    ijk: [I32; 3],
    vn: U32,
    tn: U32,
    min_index: U32,
    max_index: U32,
    adjacent: Vec<u32>,
}

fn read_leaf_header(dir: &Path, node_path: &str) -> Result<LeafInfo, Error> {
    let mut inp = BufReader::new(File::open(leaf_file(dir, node_path, 'h'))?);
    let mut buf = [0u8; std::mem::size_of::<LeafHeader>()];
    inp.read_exact(&mut buf)?;
    let header = LeafHeader::read_from_bytes(&buf)
        .map_err(|_| Error::BadFormat("bad leaf header"))?;
    let mut adjacent = Vec::with_capacity(header.nr_adjacent.get() as usize);
    for _ in 0..header.nr_adjacent.get() {
        let mut word = [0u8; 4];
        inp.read_exact(&mut word)?;
        adjacent.push(u32::from_le_bytes(word));
    }
    Ok(LeafInfo {
        leaf_index: header.leaf_index,
        size: header.size,
        ijk: header.ijk,
        vn: header.vn,
        tn: header.tn,
        min_index: header.min_index,
        max_index: header.max_index,
        adjacent,
    })
}

/// One vertex row of an adjacency file: byte offsets into the leaf's
/// adjacency table
pub(crate) type AdjacencyRow = ArrayVec<u8, 255>;

/// Writes an adjacency file, one row per vertex
pub(crate) fn write_adjacency(path: &Path, rows: &[AdjacencyRow]) -> Result<(), Error> {
    let mut out = BufWriter::new(File::create(path)?);
    for row in rows {
        out.write_all(&[row.len() as u8])?;
        out.write_all(row)?;
    }
    out.flush()?;
    Ok(())
}

/// Reads the `vn` rows of an adjacency file
pub(crate) fn read_adjacency(path: &Path, vn: usize) -> Result<Vec<AdjacencyRow>, Error> {
    let mut inp = BufReader::new(File::open(path)?);
    let mut rows = Vec::with_capacity(vn);
    for _ in 0..vn {
        let mut count = [0u8; 1];
        inp.read_exact(&mut count)?;
        let mut row = AdjacencyRow::new();
        for _ in 0..count[0] {
            let mut b = [0u8; 1];
            inp.read_exact(&mut b)?;
            row.push(b[0]);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Reads every record of a fixed-stride leaf file
pub(crate) fn read_records<R, const N: usize>(
    path: &Path,
    parse: impl Fn(&[u8; N]) -> Result<R, Error>,
) -> Result<Vec<R>, Error> {
    let mut inp = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    let mut buf = [0u8; N];
    while read_full(&mut inp, &mut buf)? {
        out.push(parse(&buf)?);
    }
    Ok(out)
}

/// Reads every final vertex of a leaf
pub(crate) fn read_vertices(path: &Path) -> Result<Vec<VertexRecord>, Error> {
    read_records(path, |buf: &[u8; VERTEX_SIZE]| {
        VertexRecord::read_from_bytes(buf).map_err(|_| Error::BadFormat("bad vertex record"))
    })
}

/// Reads every triangle of a leaf
pub(crate) fn read_triangles(path: &Path) -> Result<Vec<TriangleRecord>, Error> {
    read_records(path, |buf: &[u8; TRIANGLE_SIZE]| {
        TriangleRecord::read_from_bytes(buf)
            .map_err(|_| Error::BadFormat("bad triangle record"))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn leaf_file_paths() {
        let dir = Path::new("/data/mesh");
        assert_eq!(
            leaf_file(dir, "3/0/5", 'v'),
            Path::new("/data/mesh/3/0/5v")
        );
        assert_eq!(leaf_file(dir, "0", 't'), Path::new("/data/mesh/0t"));
    }

    #[test]
    fn triangle_record_prefix_excludes_group() {
        let mut rec = TriangleRecord::new([1, 2, 3], [10, 20, 30], -7);
        assert_eq!(rec.ref_bytes().len(), TRIANGLE_REF_SIZE);
        rec.set_ref(1, 9, 99);
        assert_eq!(rec.leaf(1), 9);
        assert_eq!(rec.vert(1), 99);
        assert_eq!(rec.group(), -7);
    }

    #[test]
    fn adjacency_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let mut rows = vec![AdjacencyRow::new(), AdjacencyRow::new()];
        rows[0].push(3);
        rows[0].push(1);
        let written = rows.clone();
        write_adjacency(&path, &rows).unwrap();
        assert_eq!(read_adjacency(&path, 2).unwrap(), written);
    }

    #[test]
    fn structure_roundtrip() {
        use crate::octree::GRID_SIZE;
        let dir = tempfile::tempdir().unwrap();
        let mut tree =
            Octree::with_bounds(Vector3::zeros(), Vector3::from_element(2.0), 1);
        tree.build([0, 0, 0]).unwrap();
        tree.build([GRID_SIZE - 1; 3]).unwrap();
        tree.assign_leaf_indices().unwrap();
        for (n, path) in ["0", "7"].iter().enumerate() {
            let id = tree.leaf(n as u32);
            let node = tree.node_mut(id);
            node.path = path.to_string();
            node.vn = 10 * (n as u32 + 1);
            node.tn = 5;
            node.min_index = 1000 * n as u32;
            node.max_index = 1000 * n as u32 + 500;
            node.adjacent = vec![1 - n as u32];
            create_leaf_dirs(dir.path(), path).unwrap();
            write_leaf_header(dir.path(), &tree, n as u32).unwrap();
        }
        write_structure(dir.path(), &tree).unwrap();

        let loaded = read_structure(dir.path()).unwrap();
        assert_eq!(loaded.leaf_count(), 2);
        assert_eq!(loaded.scale, tree.scale);
        for n in 0..2u32 {
            let a = tree.node(tree.leaf(n));
            let b = loaded.node(loaded.leaf(n));
            assert_eq!(a.size, b.size);
            assert_eq!(a.ijk, b.ijk);
            assert_eq!(a.vn, b.vn);
            assert_eq!(a.tn, b.tn);
            assert_eq!(a.min_index, b.min_index);
            assert_eq!(a.max_index, b.max_index);
            assert_eq!(a.adjacent, b.adjacent);
            assert_eq!(a.path, b.path);
        }
    }

    #[test]
    fn root_leaf_structure_roundtrip() {
        use crate::octree::GRID_SIZE;
        let dir = tempfile::tempdir().unwrap();
        let mut tree = Octree::with_bounds(Vector3::zeros(), Vector3::from_element(1.0), 3);
        // a full aggregation can merge every octant back into the root
        tree.node_mut(tree.root()).is_leaf = true;
        tree.assign_leaf_indices().unwrap();
        let id = tree.leaf(0);
        let node = tree.node_mut(id);
        node.path = "0".to_string();
        node.vn = 4;
        node.tn = 2;
        node.max_index = 10;
        create_leaf_dirs(dir.path(), "0").unwrap();
        write_leaf_header(dir.path(), &tree, 0).unwrap();
        write_structure(dir.path(), &tree).unwrap();

        let loaded = read_structure(dir.path()).unwrap();
        assert_eq!(loaded.leaf_count(), 1);
        let root = loaded.leaf(0);
        assert_eq!(root, loaded.root());
        assert!(loaded.node(root).is_leaf);
        // any grid point resolves to the root leaf
        assert_eq!(loaded.search([0, 0, 0]).unwrap(), root);
        assert_eq!(loaded.search([GRID_SIZE - 1; 3]).unwrap(), root);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Octree::from_raw(Vector3::zeros(), 1.0, 0);
        write_structure(dir.path(), &tree).unwrap();
        let path = dir.path().join(STRUCTURE_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] = 99;
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            read_structure(dir.path()),
            Err(Error::BadVersion(99))
        ));
    }
}
