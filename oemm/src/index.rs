//! Second pipeline stage: turning dispatched regions into an indexed mesh
//!
//! Three passes over the dispatched data, each reading one leaf region at a
//! time so memory stays bounded by the largest leaf, never by the mesh:
//!
//! 1. **Vertices**: deduplicate the corners of each leaf into dense local
//!    indices, record which other leaves every vertex touches, and reserve
//!    a disjoint global label range per leaf.
//! 2. **Triangles**: resolve every corner to its owning leaf and local
//!    index, and write each triangle into the lowest-indexed leaf it
//!    touches, so every triangle lands in exactly one file.
//! 3. **Coordinates**: convert the per-leaf vertex files from grid to
//!    world coordinates.
//!
//! The passes communicate only through files, so an interrupted run can be
//! restarted from the intermediate data.

use crate::dedup::{DedupTree, FlatDedupTree};
use crate::dispatch::RegionReader;
use crate::error::Error;
use crate::morton;
use crate::octree::{Flow, Node, NodeId, Octree, Visit, Visitor};
use crate::storage::{
    self, AdjacencyRow, INT_VERTEX_SIZE, IntVertexRecord, TriangleRecord, VertexRecord,
    create_leaf_dirs, leaf_file, write_adjacency, write_leaf_header,
};
use log::{debug, info};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use zerocopy::{FromBytes, IntoBytes};

fn vertex_key(ijk: [i32; 3]) -> u128 {
    morton::encode(ijk[0] as u32, ijk[1] as u32, ijk[2] as u32)
}

/// Builds the final indexed storage under `out_dir` from dispatched data
///
/// `tree` must be the octree loaded back from the intermediate structure
/// file.  On success the directory holds the four per-leaf files plus the
/// top-level structure file, and the octree carries the final counters.
pub fn build(tree: &mut Octree, data_file: &Path, out_dir: &Path) -> Result<(), Error> {
    std::fs::create_dir_all(out_dir)?;
    if tree.leaf_count() == 0 {
        storage::write_structure(out_dir, tree)?;
        return Ok(());
    }
    let total: u64 = tree.leaves().map(|id| u64::from(tree.node(id).tn)).sum();
    // split the label space left over by the worst case of three new
    // vertices per triangle evenly across leaves, as headroom for edits
    let room = ((1i64 << 31) - 3 * total as i64) / tree.leaf_count() as i64;
    if room <= 0 {
        return Err(Error::BadFormat("mesh too large for 31-bit vertex labels"));
    }

    let data = File::open(data_file)?;
    let mut pass = InnerVertexPass {
        data: &data,
        out_dir,
        segments: Vec::new(),
        depth: 0,
        global: 0,
        room,
        owned: Vec::with_capacity(tree.leaf_count()),
    };
    tree.walk(&mut pass)?;
    info!(
        "indexed vertices of {} leaves, {} labels reserved",
        pass.owned.len(),
        pass.global
    );
    let owned = std::mem::take(&mut pass.owned);

    index_triangles(tree, &data, out_dir, &owned)?;
    convert_vertices(tree, out_dir)?;
    for l in 0..tree.leaf_count() as u32 {
        write_leaf_header(out_dir, tree, l)?;
    }
    storage::write_structure(out_dir, tree)?;
    Ok(())
}

/// First pass: per-leaf vertex deduplication, adjacency and label ranges
///
/// Walks the whole tree rather than the leaf table because leaf paths (and
/// with them the storage directory layout) fall out of the octant stack.
struct InnerVertexPass<'a> {
    data: &'a File,
    out_dir: &'a Path,
    segments: Vec<String>,
    depth: usize,
    global: i64,
    room: i64,
    /// Triangles owned by each leaf, in leaf order; becomes the final
    /// per-leaf `tn` once the triangle pass has confirmed it
    owned: Vec<u32>,
}

impl Visitor for InnerVertexPass<'_> {
    fn visit(
        &mut self,
        tree: &mut Octree,
        node: NodeId,
        octant: usize,
        visit: Visit,
    ) -> Result<Flow, Error> {
        match visit {
            Visit::Preorder => {
                if self.depth > 0 {
                    self.segments.push(octant.to_string());
                }
                self.depth += 1;
            }
            Visit::Postorder => {
                self.depth -= 1;
                if self.depth > 0 {
                    self.segments.pop();
                }
            }
            Visit::Leaf => {
                let last = if self.depth == 0 {
                    // an octree collapsed to a single root leaf still
                    // needs a file stem
                    "0".to_string()
                } else {
                    octant.to_string()
                };
                let mut path = self.segments.join("/");
                if path.is_empty() {
                    path = last;
                } else {
                    path.push('/');
                    path.push_str(&last);
                }
                self.index_leaf(tree, node, path)?;
            }
        }
        Ok(Flow::Ok)
    }
}

impl InnerVertexPass<'_> {
    fn index_leaf(&mut self, tree: &mut Octree, id: NodeId, path: String) -> Result<(), Error> {
        let (size, corner, counter, tn, leaf_index) = {
            let node = tree.node_mut(id);
            node.path = path.clone();
            (node.size, node.ijk, node.counter, node.tn, node.leaf_index)
        };
        create_leaf_dirs(self.out_dir, &path)?;

        let mut region = RegionReader::open(self.data, size, corner, counter, tn)?;
        let mut inner = FlatDedupTree::new();
        let mut outer = FlatDedupTree::new();
        let mut coords: Vec<[i32; 3]> = Vec::new();
        let mut rows: Vec<AdjacencyRow> = Vec::new();
        let mut fake = -1i32;
        let mut owned = 0u32;

        while let Some(rec) = region.next_record()? {
            let mut leafs = [0u32; 3];
            let mut local = [0usize; 3];
            for i in 0..3 {
                let v = rec.vertex(i);
                let key = vertex_key(v);
                if tree.node(id).contains(v) {
                    leafs[i] = leaf_index;
                    local[i] = match inner.insert(key, coords.len() as i32) {
                        None => {
                            coords.push(v);
                            rows.push(AdjacencyRow::new());
                            coords.len() - 1
                        }
                        Some(prev) => prev as usize,
                    };
                } else {
                    leafs[i] = tree.node(tree.search(v)?).leaf_index;
                    // count each external point once, under a synthetic
                    // negative index; the triangle pass resolves the
                    // real one
                    if outer.insert(key, fake).is_none() {
                        fake -= 1;
                    }
                }
            }
            for i in 0..3 {
                if leafs[i] != leaf_index {
                    continue;
                }
                for j in 0..3 {
                    if j == i || leafs[j] == leaf_index {
                        continue;
                    }
                    let byte = adjacent_position(tree.node_mut(id), leafs[j])?;
                    let row = &mut rows[local[i]];
                    if !row.contains(&byte) {
                        row.try_push(byte)
                            .map_err(|_| Error::AdjacencyOverflow(leaf_index))?;
                    }
                }
            }
            if leafs.iter().all(|&l| l >= leaf_index) {
                owned += 1;
            }
        }

        let node = tree.node_mut(id);
        node.vn = coords.len() as u32;
        node.min_index = self.global as u32;
        node.max_index = (self.global + coords.len() as i64 + self.room - 1) as u32;
        self.global += coords.len() as i64 + self.room;
        self.owned.push(owned);
        debug!(
            "leaf {leaf_index}: {} vertices ({} external), {owned} owned triangles",
            coords.len(),
            outer.len(),
        );

        let mut out = BufWriter::new(File::create(leaf_file(self.out_dir, &path, 'v'))?);
        for &v in &coords {
            out.write_all(IntVertexRecord::new(v).as_bytes())?;
        }
        out.flush()?;
        write_adjacency(&leaf_file(self.out_dir, &path, 'a'), &rows)?;
        Ok(())
    }
}

/// Finds (or adds) a leaf in the adjacency table of `node`, returning its
/// byte offset
fn adjacent_position(node: &mut Node, leaf: u32) -> Result<u8, Error> {
    if let Some(p) = node.adjacent.iter().position(|&x| x == leaf) {
        return Ok(p as u8);
    }
    if node.adjacent.len() >= 256 {
        return Err(Error::AdjacencyOverflow(node.leaf_index));
    }
    node.adjacent.push(leaf);
    Ok((node.adjacent.len() - 1) as u8)
}

/// Loads the deduplication tree of one leaf back from its vertex file
fn load_vertex_tree(tree: &Octree, out_dir: &Path, leaf: u32) -> Result<DedupTree, Error> {
    let path = &tree.node(tree.leaf(leaf)).path;
    let records = storage::read_records(
        &leaf_file(out_dir, path, 'v'),
        |buf: &[u8; INT_VERTEX_SIZE]| {
            IntVertexRecord::read_from_bytes(buf)
                .map_err(|_| Error::BadFormat("bad vertex record"))
        },
    )?;
    let mut dedup = DedupTree::new();
    for (n, rec) in records.iter().enumerate() {
        dedup.insert(vertex_key(rec.get()), n as i32);
    }
    Ok(dedup)
}

/// Second pass: write every triangle into the lowest-indexed leaf it
/// touches, with all corners resolved to `(leaf, local)` references
fn index_triangles(
    tree: &mut Octree,
    data: &File,
    out_dir: &Path,
    owned: &[u32],
) -> Result<(), Error> {
    for l in 0..tree.leaf_count() as u32 {
        let id = tree.leaf(l);
        let (size, corner, counter, tn, path) = {
            let node = tree.node(id);
            (node.size, node.ijk, node.counter, node.tn, node.path.clone())
        };
        let mut region = RegionReader::open(data, size, corner, counter, tn)?;
        // per-leaf trees are rebuilt for every region to keep memory
        // bounded; only the current leaf and its neighbors ever show up
        let mut cache: HashMap<u32, DedupTree> = HashMap::new();
        let mut out = BufWriter::new(File::create(leaf_file(out_dir, &path, 't'))?);
        let mut written = 0u32;
        while let Some(rec) = region.next_record()? {
            let mut leafs = [0u32; 3];
            let mut locals = [0u32; 3];
            for i in 0..3 {
                let v = rec.vertex(i);
                let li = tree.node(tree.search(v)?).leaf_index;
                leafs[i] = li;
                if !cache.contains_key(&li) {
                    cache.insert(li, load_vertex_tree(tree, out_dir, li)?);
                }
                locals[i] = cache[&li]
                    .get(vertex_key(v))
                    .ok_or(Error::BadFormat("vertex missing from its leaf"))?
                    as u32;
            }
            if leafs.iter().all(|&x| x >= l) {
                out.write_all(TriangleRecord::new(leafs, locals, rec.group()).as_bytes())?;
                written += 1;
            }
        }
        out.flush()?;
        if written != owned[l as usize] {
            return Err(Error::BadFormat("triangle ownership changed between passes"));
        }
        tree.node_mut(id).tn = written;
    }
    info!("indexed triangles of {} leaves", tree.leaf_count());
    Ok(())
}

/// Third pass: rewrite vertex files from grid to world coordinates
fn convert_vertices(tree: &Octree, out_dir: &Path) -> Result<(), Error> {
    for id in tree.leaves() {
        let path = &tree.node(id).path;
        let file = leaf_file(out_dir, path, 'v');
        let records = storage::read_records(&file, |buf: &[u8; INT_VERTEX_SIZE]| {
            IntVertexRecord::read_from_bytes(buf)
                .map_err(|_| Error::BadFormat("bad vertex record"))
        })?;
        let mut out = BufWriter::new(File::create(&file)?);
        for rec in &records {
            let p = tree.int2double(rec.get());
            out.write_all(VertexRecord::new(&p).as_bytes())?;
        }
        out.flush()?;
    }
    Ok(())
}
