//! Saving an edited mesh back into its leaves
//!
//! Saving rewrites the files of the loaded leaves and nothing else, with
//! one exception: when a vertex changes its global label (because it moved
//! into another leaf, or because label compaction renumbered it), triangle
//! files of *unloaded* neighbor leaves that reference it are patched in
//! place.  All renumbering maps are computed up front, before the first
//! byte is written, so a failed validation leaves the storage untouched.

use crate::error::Error;
use crate::mesh::{Mesh, UNASSIGNED};
use crate::octree::Octree;
use crate::storage::{
    AdjacencyRow, TRIANGLE_SIZE, TriangleRecord, VertexRecord, leaf_file, read_adjacency,
    write_adjacency, write_leaf_header,
};
use log::{debug, info};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use zerocopy::{FromBytes, IntoBytes};

/// Writes an edited [`Mesh`] back to an indexed mesh directory
pub struct MeshWriter<'a> {
    tree: &'a mut Octree,
    dir: PathBuf,
}

/// Final destination of one mesh vertex
#[derive(Copy, Clone)]
struct Dest {
    leaf: u32,
    local: u32,
}

impl<'a> MeshWriter<'a> {
    pub fn new(tree: &'a mut Octree, dir: &Path) -> Self {
        Self {
            tree,
            dir: dir.to_path_buf(),
        }
    }

    /// Saves the mesh into the leaves it was loaded from
    ///
    /// `selected` must be the leaf set the mesh was read with.  Vertices no
    /// longer referenced by any triangle are dropped; vertices whose
    /// position now quantizes into a different leaf move there, which
    /// requires both the vertex to be writable and the target leaf to be
    /// loaded.
    pub fn save(&mut self, mesh: &Mesh, selected: &[u32]) -> Result<(), Error> {
        let nr = self.tree.leaf_count();
        let mut chosen = selected.to_vec();
        chosen.sort_unstable();
        chosen.dedup();
        if chosen.iter().any(|&l| l as usize >= nr) {
            return Err(Error::BadFormat("leaf index out of range"));
        }
        let mut loaded = vec![false; nr];
        for &l in &chosen {
            loaded[l as usize] = true;
        }

        let mut used = vec![false; mesh.vertices.len()];
        for t in &mesh.triangles {
            for &i in &t.v {
                used[i] = true;
            }
        }

        // decide the owning leaf of every surviving vertex
        let mut bucket: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut dest: Vec<Option<Dest>> = vec![None; mesh.vertices.len()];
        for (i, v) in mesh.vertices.iter().enumerate() {
            // only writable vertices may be dropped when unreferenced;
            // a frozen vertex can still be referenced from the triangle
            // file of a leaf outside the loaded set
            if !used[i] && v.writable {
                continue;
            }
            if v.label != UNASSIGNED && !loaded[v.leaf as usize] {
                // frozen copy of an unloaded leaf's vertex
                dest[i] = Some(Dest {
                    leaf: v.leaf,
                    local: v.local,
                });
                continue;
            }
            let ijk = self.tree.double2int(&v.pos);
            let actual = self.tree.node(self.tree.search(ijk)?).leaf_index;
            if v.label != UNASSIGNED && actual != v.leaf && !v.writable {
                return Err(Error::MovedNonWritable(v.label));
            }
            if !loaded[actual as usize] {
                return Err(Error::LeafNotLoaded(actual));
            }
            bucket.entry(actual).or_default().push(i);
        }

        // assign dense local indices per leaf, compacting label holes;
        // nothing is written yet
        let mut finals: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut relabeled: HashMap<u32, Dest> = HashMap::new();
        for &l in &chosen {
            let entries = bucket.remove(&l).unwrap_or_default();
            let node = self.tree.node(self.tree.leaf(l));
            let last = node.min_index as u64 + entries.len() as u64;
            if !entries.is_empty() && last - 1 > node.max_index as u64 {
                return Err(Error::IndexCapacityExceeded {
                    leaf: l,
                    label: (last - 1) as u32,
                });
            }
            let mut stable = Vec::new();
            let mut incoming = Vec::new();
            for idx in entries {
                let v = &mesh.vertices[idx];
                if v.label != UNASSIGNED && v.leaf == l {
                    stable.push((v.label, idx));
                } else {
                    incoming.push(idx);
                }
            }
            let order = compact_labels(node.min_index, stable, incoming);
            for (local, &idx) in order.iter().enumerate() {
                let d = Dest {
                    leaf: l,
                    local: local as u32,
                };
                dest[idx] = Some(d);
                let v = &mesh.vertices[idx];
                let new_label = node.min_index + local as u32;
                if v.label != UNASSIGNED && v.label != new_label {
                    relabeled.insert(v.label, d);
                }
            }
            finals.insert(l, order);
        }

        // triangles go to the lowest leaf they touch after the moves
        let mut tri_bucket: HashMap<u32, Vec<TriangleRecord>> = HashMap::new();
        for t in &mesh.triangles {
            let mut leafs = [0u32; 3];
            let mut verts = [0u32; 3];
            for (j, &vi) in t.v.iter().enumerate() {
                let d = dest[vi].ok_or(Error::BadFormat("triangle over dropped vertex"))?;
                leafs[j] = d.leaf;
                verts[j] = d.local;
            }
            let owner = leafs.iter().copied().min().unwrap_or(0);
            if !loaded[owner as usize] {
                return Err(Error::LeafNotLoaded(owner));
            }
            tri_bucket
                .entry(owner)
                .or_default()
                .push(TriangleRecord::new(leafs, verts, t.group));
        }

        // snapshot the old adjacency data before anything is overwritten
        let mut old_rows: HashMap<u32, Vec<AdjacencyRow>> = HashMap::new();
        let mut old_tables: HashMap<u32, Vec<u32>> = HashMap::new();
        for &l in &chosen {
            let node = self.tree.node(self.tree.leaf(l));
            old_rows.insert(
                l,
                read_adjacency(&leaf_file(&self.dir, &node.path, 'a'), node.vn as usize)?,
            );
            old_tables.insert(l, node.adjacent.clone());
        }

        // neighbor leaves per vertex, from the edited triangles
        let mut neighbor_sets: Vec<BTreeSet<u32>> = vec![BTreeSet::new(); mesh.vertices.len()];
        for t in &mesh.triangles {
            for &a in &t.v {
                let Some(da) = dest[a] else { continue };
                for &b in &t.v {
                    let Some(db) = dest[b] else { continue };
                    if da.leaf != db.leaf {
                        neighbor_sets[a].insert(db.leaf);
                    }
                }
            }
        }

        // leaves adjacent to an unloaded neighbor of a relabeled vertex
        // need their triangle files patched
        let mut patch_leaves: BTreeSet<u32> = BTreeSet::new();

        // build the new adjacency tables and rows
        let mut new_tables: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut new_rows: HashMap<u32, Vec<AdjacencyRow>> = HashMap::new();
        for &l in &chosen {
            let order = &finals[&l];
            let mut table: Vec<u32> = Vec::new();
            let mut rows = Vec::with_capacity(order.len());
            for &idx in order {
                let v = &mesh.vertices[idx];
                let mut set = neighbor_sets[idx].clone();
                if v.label != UNASSIGNED {
                    // adjacency toward unloaded leaves is invisible in the
                    // mesh; carry it over from the old row
                    let row = &old_rows[&v.leaf][v.local as usize];
                    let tab = &old_tables[&v.leaf];
                    for &b in row.iter() {
                        let g = *tab
                            .get(b as usize)
                            .ok_or(Error::BadFormat("adjacency offset out of table"))?;
                        if !loaded[g as usize] {
                            set.insert(g);
                        }
                    }
                }
                if relabeled.contains_key(&v.label) {
                    for &g in &set {
                        if !loaded[g as usize] {
                            patch_leaves.insert(g);
                        }
                    }
                }
                let mut row = AdjacencyRow::new();
                for &g in &set {
                    let byte = match table.iter().position(|&x| x == g) {
                        Some(p) => p as u8,
                        None => {
                            if table.len() >= 256 {
                                return Err(Error::AdjacencyOverflow(l));
                            }
                            table.push(g);
                            (table.len() - 1) as u8
                        }
                    };
                    row.try_push(byte)
                        .map_err(|_| Error::AdjacencyOverflow(l))?;
                }
                rows.push(row);
            }
            new_tables.insert(l, table);
            new_rows.insert(l, rows);
        }

        // every map is complete; start writing
        for &l in &chosen {
            let id = self.tree.leaf(l);
            let path = self.tree.node(id).path.clone();
            let order = &finals[&l];

            let mut out = BufWriter::new(File::create(leaf_file(&self.dir, &path, 'v'))?);
            for &idx in order {
                out.write_all(VertexRecord::new(&mesh.vertices[idx].pos).as_bytes())?;
            }
            out.flush()?;
            write_adjacency(&leaf_file(&self.dir, &path, 'a'), &new_rows[&l])?;

            let tris = tri_bucket.remove(&l).unwrap_or_default();
            let mut out = BufWriter::new(File::create(leaf_file(&self.dir, &path, 't'))?);
            for rec in &tris {
                out.write_all(rec.as_bytes())?;
            }
            out.flush()?;

            let node = self.tree.node_mut(id);
            node.vn = order.len() as u32;
            node.tn = tris.len() as u32;
            node.adjacent = new_tables.remove(&l).unwrap_or_default();
            write_leaf_header(&self.dir, self.tree, l)?;
        }
        info!(
            "saved {} leaves, {} vertices relabeled",
            chosen.len(),
            relabeled.len()
        );

        self.patch_unloaded(&patch_leaves, &relabeled)
    }

    /// Rewrites stale `(leaf, local)` references inside the triangle files
    /// of unloaded leaves
    fn patch_unloaded(
        &mut self,
        patch_leaves: &BTreeSet<u32>,
        relabeled: &HashMap<u32, Dest>,
    ) -> Result<(), Error> {
        for &u in patch_leaves {
            let path = self.tree.node(self.tree.leaf(u)).path.clone();
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(leaf_file(&self.dir, &path, 't'))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            if buf.len() % TRIANGLE_SIZE != 0 {
                return Err(Error::BadFormat("bad triangle file length"));
            }
            let mut patched = 0u32;
            for (n, chunk) in buf.chunks_exact(TRIANGLE_SIZE).enumerate() {
                let mut rec = TriangleRecord::read_from_bytes(chunk)
                    .map_err(|_| Error::BadFormat("bad triangle record"))?;
                let mut touched = false;
                for c in 0..3 {
                    let owner = self.tree.node(self.tree.leaf(rec.leaf(c)));
                    let label = owner.min_index + rec.vert(c);
                    if let Some(d) = relabeled.get(&label) {
                        rec.set_ref(c, d.leaf, d.local);
                        touched = true;
                    }
                }
                if touched {
                    file.seek(SeekFrom::Start((n * TRIANGLE_SIZE) as u64))?;
                    file.write_all(rec.ref_bytes())?;
                    patched += 1;
                }
            }
            debug!("patched {patched} triangles in leaf {u}");
        }
        Ok(())
    }
}

/// Orders a leaf's vertices so that labels become the dense run starting
/// at `min_index`
///
/// `stable` holds `(old label, vertex)` pairs already owned by the leaf;
/// `incoming` holds moved and new vertices.  Vertices whose old label
/// equals its dense position keep it; holes left by departed vertices are
/// filled from the incoming pool first and from the highest old labels
/// last, so as few vertices as possible change label.
fn compact_labels(
    min_index: u32,
    mut stable: Vec<(u32, usize)>,
    mut incoming: Vec<usize>,
) -> Vec<usize> {
    stable.sort_unstable_by_key(|&(label, _)| label);
    let mut front: VecDeque<(u32, usize)> = stable.into();
    let total = front.len() + incoming.len();
    let mut order = Vec::with_capacity(total);
    while order.len() < total {
        let expected = min_index + order.len() as u32;
        if let Some(&(label, idx)) = front.front() {
            if label == expected {
                front.pop_front();
                order.push(idx);
                continue;
            }
        }
        if let Some(idx) = incoming.pop() {
            order.push(idx);
        } else if let Some((_, idx)) = front.pop_back() {
            order.push(idx);
        }
    }
    order
}

#[cfg(test)]
mod test {
    use super::compact_labels;

    #[test]
    fn dense_labels_stay_put() {
        let stable = vec![(100, 0), (101, 1), (102, 2)];
        assert_eq!(compact_labels(100, stable, vec![]), vec![0, 1, 2]);
    }

    #[test]
    fn holes_are_filled_from_the_tail() {
        // labels 100, 101, 104, 105 with two holes
        let stable = vec![(104, 2), (100, 0), (105, 3), (101, 1)];
        // vertex with label 105 drops into the first hole, 104 keeps its
        // relative position at the second
        assert_eq!(compact_labels(100, stable, vec![]), vec![0, 1, 3, 2]);
    }

    #[test]
    fn incoming_fill_holes_before_relabeling_old_vertices() {
        let stable = vec![(100, 0), (103, 1)];
        let order = compact_labels(100, stable, vec![7]);
        // incoming vertex 7 takes label 101, old vertex 1 is pulled down
        // to 102
        assert_eq!(order, vec![0, 7, 1]);
    }

    #[test]
    fn all_new_vertices() {
        let order = compact_labels(50, vec![], vec![4, 5, 6]);
        assert_eq!(order.len(), 3);
        let set: std::collections::HashSet<_> = order.into_iter().collect();
        assert_eq!(set, [4, 5, 6].into_iter().collect());
    }
}
