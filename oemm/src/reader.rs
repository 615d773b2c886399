//! Loading a subset of leaves into an editable mesh

use crate::error::Error;
use crate::mesh::{Mesh, Triangle, Vertex};
use crate::octree::Octree;
use crate::storage::{
    VERTEX_SIZE, VertexRecord, leaf_file, read_adjacency, read_triangles, read_vertices,
};
use log::info;
use nalgebra::Vector3;
use zerocopy::FromBytes;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Reads leaves of an indexed mesh directory into a [`Mesh`]
///
/// Triangles owned by a loaded leaf may refer to vertices of unloaded
/// leaves; those come in as non-writable placeholder vertices whose
/// coordinates are fetched from the neighbor files (one sorted sweep per
/// file), unless distant loading is switched off.
pub struct MeshReader<'a> {
    tree: &'a Octree,
    dir: PathBuf,
    load_distant: bool,
}

impl<'a> MeshReader<'a> {
    pub fn new(tree: &'a Octree, dir: &Path) -> Self {
        Self {
            tree,
            dir: dir.to_path_buf(),
            load_distant: true,
        }
    }

    /// Controls whether placeholder coordinates are fetched from unloaded
    /// leaves; without them, boundary triangles stay non-readable
    pub fn set_load_distant_vertices(&mut self, on: bool) {
        self.load_distant = on;
    }

    /// Loads every leaf of the octree
    pub fn read_all(&self) -> Result<Mesh, Error> {
        let all: Vec<u32> = (0..self.tree.leaf_count() as u32).collect();
        self.read(&all)
    }

    /// Loads the given leaves into a fresh mesh
    pub fn read(&self, selected: &[u32]) -> Result<Mesh, Error> {
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

        let mut mesh = Mesh::new();
        let mut by_label: HashMap<u32, usize> = HashMap::new();

        for &l in &chosen {
            let node = self.tree.node(self.tree.leaf(l));
            let verts = read_vertices(&leaf_file(&self.dir, &node.path, 'v'))?;
            if verts.len() != node.vn as usize {
                return Err(Error::BadFormat("vertex file does not match header"));
            }
            let rows = read_adjacency(&leaf_file(&self.dir, &node.path, 'a'), verts.len())?;
            for (i, rec) in verts.iter().enumerate() {
                let mut writable = true;
                for &b in &rows[i] {
                    let adj = *node
                        .adjacent
                        .get(b as usize)
                        .ok_or(Error::BadFormat("adjacency offset out of table"))?;
                    writable &= loaded[adj as usize];
                }
                let label = node.min_index + i as u32;
                by_label.insert(label, mesh.vertices.len());
                mesh.vertices.push(Vertex {
                    pos: rec.get(),
                    label,
                    leaf: l,
                    local: i as u32,
                    readable: true,
                    writable,
                });
            }
        }

        // placeholders to fetch, grouped per unloaded leaf
        let mut distant: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for &l in &chosen {
            let node = self.tree.node(self.tree.leaf(l));
            let recs = read_triangles(&leaf_file(&self.dir, &node.path, 't'))?;
            if recs.len() != node.tn as usize {
                return Err(Error::BadFormat("triangle file does not match header"));
            }
            for rec in &recs {
                let mut v = [0usize; 3];
                let mut writable = true;
                for j in 0..3 {
                    let owner = rec.leaf(j);
                    let other = self.tree.node(self.tree.leaf(owner));
                    if rec.vert(j) >= other.vn {
                        return Err(Error::BadFormat("dangling vertex reference"));
                    }
                    let label = other.min_index + rec.vert(j);
                    if loaded[owner as usize] {
                        v[j] = *by_label
                            .get(&label)
                            .ok_or(Error::BadFormat("dangling vertex reference"))?;
                    } else {
                        writable = false;
                        v[j] = match by_label.get(&label) {
                            Some(&idx) => idx,
                            None => {
                                let idx = mesh.vertices.len();
                                by_label.insert(label, idx);
                                mesh.vertices.push(Vertex {
                                    pos: Vector3::zeros(),
                                    label,
                                    leaf: owner,
                                    local: rec.vert(j),
                                    readable: false,
                                    writable: false,
                                });
                                distant.entry(owner).or_default().push(idx);
                                idx
                            }
                        };
                    }
                }
                mesh.triangles.push(Triangle {
                    v,
                    group: rec.group(),
                    readable: writable || self.load_distant,
                    writable,
                });
            }
        }

        if self.load_distant {
            self.fetch_distant(&mut mesh, &distant)?;
        }
        info!(
            "loaded {} leaves: {} vertices, {} triangles",
            chosen.len(),
            mesh.vertices.len(),
            mesh.triangles.len()
        );
        Ok(mesh)
    }

    /// Reads placeholder coordinates from unloaded leaves, each file swept
    /// once in ascending local order
    fn fetch_distant(
        &self,
        mesh: &mut Mesh,
        distant: &BTreeMap<u32, Vec<usize>>,
    ) -> Result<(), Error> {
        for (&leaf, idxs) in distant {
            let node = self.tree.node(self.tree.leaf(leaf));
            let mut file = File::open(leaf_file(&self.dir, &node.path, 'v'))?;
            let mut sorted = idxs.clone();
            sorted.sort_by_key(|&i| mesh.vertices[i].local);
            let mut buf = [0u8; VERTEX_SIZE];
            for i in sorted {
                let local = mesh.vertices[i].local;
                file.seek(SeekFrom::Start(u64::from(local) * VERTEX_SIZE as u64))?;
                file.read_exact(&mut buf)?;
                let rec = VertexRecord::read_from_bytes(&buf)
                    .map_err(|_| Error::BadFormat("bad vertex record"))?;
                mesh.vertices[i].pos = rec.get();
                mesh.vertices[i].readable = true;
            }
        }
        Ok(())
    }
}
