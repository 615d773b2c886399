//! First pipeline stage: sorting raw soup into per-leaf disk regions
//!
//! The soup is scanned twice.  [`count`] snaps every corner onto the grid
//! and counts, per leaf, how many triangles touch it; a triangle spanning
//! several leaves is counted once in each.  [`dispatch`] then lays the data
//! file out as one contiguous region per leaf, sized from those counts, and
//! streams every triangle into the region of each leaf it touches, buffered
//! so that a handful of scattered writes replaces millions of seeks.
//!
//! The resulting octree shape is persisted in a small intermediate
//! structure file, so indexing can resume from the dispatched data alone.

use crate::error::Error;
use crate::octree::Octree;
use crate::soup::{SoupReader, read_full};
use log::info;
use nalgebra::Vector3;
use static_assertions::const_assert_eq;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use zerocopy::byteorder::little_endian::{F64, I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// On-disk size of one dispatched triangle record
pub(crate) const DISPATCH_RECORD_SIZE: usize = 40;

/// On-disk size of a region header in the dispatched data file
pub(crate) const REGION_HEADER_SIZE: usize = 24;

/// Records buffered per leaf before flushing to the data file
const FLUSH_RECORDS: usize = 128;

const INTERMEDIATE_VERSION: u32 = 1;

/// One grid-quantized triangle inside a leaf region
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct DispatchRecord {
    ijk: [I32; 9],
    group: I32,
}

const_assert_eq!(std::mem::size_of::<DispatchRecord>(), DISPATCH_RECORD_SIZE);

impl DispatchRecord {
    fn new(v: [[i32; 3]; 3], group: i32) -> Self {
        let mut ijk = [I32::new(0); 9];
        for i in 0..3 {
            for a in 0..3 {
                ijk[3 * i + a] = I32::new(v[i][a]);
            }
        }
        Self {
            ijk,
            group: I32::new(group),
        }
    }

    pub(crate) fn vertex(&self, i: usize) -> [i32; 3] {
        [
            self.ijk[3 * i].get(),
            self.ijk[3 * i + 1].get(),
            self.ijk[3 * i + 2].get(),
        ]
    }

    pub(crate) fn group(&self) -> i32 {
        self.group.get()
    }
}

/// Header written at the start of each leaf region, used as a consistency
/// check when the region is read back
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct RegionHeader {
    pub size: I32,
    pub ijk: [I32; 3],
    /// Record capacity reserved for this region
    pub reserved: U32,
    _pad: [u8; 4],
}

const_assert_eq!(std::mem::size_of::<RegionHeader>(), REGION_HEADER_SIZE);

#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct IntermediateHeader {
    version: U32,
    level: U32,
    nr_leaves: U32,
    name_len: U32,
    origin: [F64; 3],
    scale: F64,
}

#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct IntermediateLeaf {
    counter: U64,
    tn: U32,
    size: I32,
    ijk: [I32; 3],
}

/// Outcome of the counting pass
#[derive(Debug)]
pub struct CountReport {
    /// Triangle records read from the soup
    pub triangles: u64,
    /// Bounding box of all corners encountered
    pub bbox_min: Vector3<f64>,
    /// Bounding box of all corners encountered
    pub bbox_max: Vector3<f64>,
    /// `false` when at least one corner quantized outside the grid; the
    /// caller must rebuild the octree from the reported bounding box and
    /// count again
    pub in_domain: bool,
}

/// Counts, per leaf, how many triangles touch it, creating leaves on the
/// way.  A triangle spanning several leaves counts once in each.
pub fn count(tree: &mut Octree, soup: &Path) -> Result<CountReport, Error> {
    let mut report = CountReport {
        triangles: 0,
        bbox_min: Vector3::from_element(f64::INFINITY),
        bbox_max: Vector3::from_element(f64::NEG_INFINITY),
        in_domain: true,
    };
    let mut reader = SoupReader::open(soup)?;
    while let Some(rec) = reader.next_record()? {
        report.triangles += 1;
        let mut ijk = [[0i32; 3]; 3];
        let mut inside = true;
        for i in 0..3 {
            let p = rec.vertex(i);
            report.bbox_min = report.bbox_min.inf(&p);
            report.bbox_max = report.bbox_max.sup(&p);
            ijk[i] = tree.double2int(&p);
            inside &= Octree::in_domain(ijk[i]);
        }
        if !inside {
            report.in_domain = false;
            continue;
        }
        let a = tree.build(ijk[0])?;
        tree.node_mut(a).tn += 1;
        let b = tree.build(ijk[1])?;
        if b != a {
            tree.node_mut(b).tn += 1;
        }
        let c = tree.build(ijk[2])?;
        if c != a && c != b {
            tree.node_mut(c).tn += 1;
        }
    }
    info!(
        "counted {} triangles, domain {:?} .. {:?}",
        report.triangles, report.bbox_min, report.bbox_max
    );
    Ok(report)
}

struct LeafBuffer {
    cursor: u64,
    buf: Vec<u8>,
}

impl LeafBuffer {
    fn flush(&mut self, out: &mut File) -> Result<(), Error> {
        if !self.buf.is_empty() {
            out.seek(SeekFrom::Start(self.cursor))?;
            out.write_all(&self.buf)?;
            self.cursor += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }
}

/// Streams the soup into per-leaf regions of `data_file` and records the
/// final octree shape in `struct_file`
///
/// The counting pass must have run on `tree` with the same soup; region
/// sizes come from its per-leaf counts.
pub fn dispatch(
    tree: &mut Octree,
    soup: &Path,
    data_file: &Path,
    struct_file: &Path,
) -> Result<(), Error> {
    tree.assign_leaf_indices()?;
    let ids: Vec<_> = tree.leaves().collect();

    // lay out one region per leaf and reset the counters; the dispatch
    // loop recounts exactly, without the double counting a merged leaf
    // inherits from its former children
    let mut offset = 0u64;
    let mut reserved = Vec::with_capacity(ids.len());
    for &id in &ids {
        let node = tree.node_mut(id);
        node.counter = offset;
        reserved.push(node.tn);
        offset += (REGION_HEADER_SIZE + node.tn as usize * DISPATCH_RECORD_SIZE) as u64;
        node.tn = 0;
    }

    let mut out = File::create(data_file)?;
    out.set_len(offset)?;
    let mut buffers = Vec::with_capacity(ids.len());
    for (n, &id) in ids.iter().enumerate() {
        let node = tree.node(id);
        let header = RegionHeader {
            size: I32::new(node.size),
            ijk: node.ijk.map(I32::new),
            reserved: U32::new(reserved[n]),
            _pad: [0; 4],
        };
        out.seek(SeekFrom::Start(node.counter))?;
        out.write_all(header.as_bytes())?;
        buffers.push(LeafBuffer {
            cursor: node.counter + REGION_HEADER_SIZE as u64,
            buf: Vec::new(),
        });
    }

    let mut reader = SoupReader::open(soup)?;
    while let Some(rec) = reader.next_record()? {
        let mut ijk = [[0i32; 3]; 3];
        let mut leaf = [0usize; 3];
        for i in 0..3 {
            ijk[i] = tree.double2int(&rec.vertex(i));
            leaf[i] = tree.node(tree.search(ijk[i])?).leaf_index as usize;
        }
        let record = DispatchRecord::new(ijk, rec.group());
        for i in 0..3 {
            if leaf[..i].contains(&leaf[i]) {
                continue;
            }
            let node = tree.node_mut(ids[leaf[i]]);
            node.tn += 1;
            if node.tn > reserved[leaf[i]] {
                return Err(Error::BadFormat("soup file changed between passes"));
            }
            let b = &mut buffers[leaf[i]];
            b.buf.extend_from_slice(record.as_bytes());
            if b.buf.len() >= FLUSH_RECORDS * DISPATCH_RECORD_SIZE {
                b.flush(&mut out)?;
            }
        }
    }
    for b in &mut buffers {
        b.flush(&mut out)?;
    }
    info!("dispatched soup into {} regions", ids.len());

    write_intermediate(tree, data_file, struct_file)
}

fn write_intermediate(tree: &Octree, data_file: &Path, struct_file: &Path) -> Result<(), Error> {
    let name = data_file
        .file_name()
        .ok_or(Error::BadFormat("data file has no name"))?
        .to_string_lossy()
        .into_owned();
    let mut out = BufWriter::new(File::create(struct_file)?);
    let header = IntermediateHeader {
        version: U32::new(INTERMEDIATE_VERSION),
        level: U32::new(tree.level()),
        nr_leaves: U32::new(tree.leaf_count() as u32),
        name_len: U32::new(name.len() as u32),
        origin: [
            F64::new(tree.origin[0]),
            F64::new(tree.origin[1]),
            F64::new(tree.origin[2]),
        ],
        scale: F64::new(tree.scale),
    };
    out.write_all(header.as_bytes())?;
    out.write_all(name.as_bytes())?;
    for id in tree.leaves() {
        let node = tree.node(id);
        let leaf = IntermediateLeaf {
            counter: U64::new(node.counter),
            tn: U32::new(node.tn),
            size: I32::new(node.size),
            ijk: node.ijk.map(I32::new),
        };
        out.write_all(leaf.as_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// Rebuilds the dispatched octree from an intermediate structure file,
/// returning it together with the path of the data file
pub fn load_intermediate(struct_file: &Path) -> Result<(Octree, PathBuf), Error> {
    let mut inp = BufReader::new(File::open(struct_file)?);
    let mut buf = [0u8; std::mem::size_of::<IntermediateHeader>()];
    inp.read_exact(&mut buf)?;
    let header = IntermediateHeader::read_from_bytes(&buf)
        .map_err(|_| Error::BadFormat("bad intermediate header"))?;
    if header.version.get() != INTERMEDIATE_VERSION {
        return Err(Error::BadVersion(header.version.get()));
    }
    let mut name = vec![0u8; header.name_len.get() as usize];
    inp.read_exact(&mut name)?;
    let name = String::from_utf8(name)
        .map_err(|_| Error::BadFormat("bad data file name"))?;

    let origin = Vector3::new(
        header.origin[0].get(),
        header.origin[1].get(),
        header.origin[2].get(),
    );
    let mut tree = Octree::from_raw(origin, header.scale.get(), header.level.get());
    for i in 0..header.nr_leaves.get() {
        let mut buf = [0u8; std::mem::size_of::<IntermediateLeaf>()];
        inp.read_exact(&mut buf)?;
        let leaf = IntermediateLeaf::read_from_bytes(&buf)
            .map_err(|_| Error::BadFormat("bad intermediate leaf"))?;
        let ijk = leaf.ijk.map(|c| c.get());
        let id = tree.build_sized(leaf.size.get(), ijk)?;
        let node = tree.node_mut(id);
        node.counter = leaf.counter.get();
        node.tn = leaf.tn.get();
        tree.register_leaf(i, id)?;
    }
    let data = match struct_file.parent() {
        Some(dir) => dir.join(&name),
        None => PathBuf::from(&name),
    };
    Ok((tree, data))
}

/// Iterator over the records of one leaf region in the data file
pub(crate) struct RegionReader<'a> {
    inp: BufReader<&'a File>,
    remaining: u32,
}

impl<'a> RegionReader<'a> {
    /// Positions the reader at the region of `node` and checks the header
    /// against the octree
    pub(crate) fn open(
        data: &'a File,
        node_size: i32,
        node_ijk: [i32; 3],
        counter: u64,
        tn: u32,
    ) -> Result<Self, Error> {
        let mut inp = BufReader::new(data);
        inp.seek(SeekFrom::Start(counter))?;
        let mut buf = [0u8; REGION_HEADER_SIZE];
        inp.read_exact(&mut buf)?;
        let header = RegionHeader::read_from_bytes(&buf)
            .map_err(|_| Error::BadFormat("bad region header"))?;
        if header.size.get() != node_size
            || header.ijk.map(|c| c.get()) != node_ijk
            || header.reserved.get() < tn
        {
            return Err(Error::BadFormat("region header does not match octree"));
        }
        Ok(Self { inp, remaining: tn })
    }

    pub(crate) fn next_record(&mut self) -> Result<Option<DispatchRecord>, Error> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut buf = [0u8; DISPATCH_RECORD_SIZE];
        if !read_full(&mut self.inp, &mut buf)? {
            return Err(Error::BadFormat("region ends before its record count"));
        }
        let rec = DispatchRecord::read_from_bytes(&buf)
            .map_err(|_| Error::BadFormat("bad dispatched record"))?;
        Ok(Some(rec))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::soup::SoupWriter;

    fn write_soup(path: &Path, tris: &[[Vector3<f64>; 3]]) {
        let mut w = SoupWriter::create(path).unwrap();
        for (n, t) in tris.iter().enumerate() {
            w.add(t, n as i32).unwrap();
        }
        w.finish().unwrap();
    }

    fn corner_triangle(x: f64, y: f64, z: f64) -> [Vector3<f64>; 3] {
        [
            Vector3::new(x, y, z),
            Vector3::new(x + 0.01, y, z),
            Vector3::new(x, y + 0.01, z),
        ]
    }

    #[test]
    fn count_detects_out_of_domain() {
        let dir = tempfile::tempdir().unwrap();
        let soup = dir.path().join("soup");
        write_soup(&soup, &[corner_triangle(0.1, 0.1, 0.1)]);
        let mut tree = Octree::with_bounds(
            Vector3::zeros(),
            Vector3::new(0.01, 0.01, 0.01),
            2,
        );
        let report = count(&mut tree, &soup).unwrap();
        assert!(!report.in_domain);
        // rebuilding from the reported box makes the second pass succeed
        let mut tree = Octree::with_bounds(report.bbox_min, report.bbox_max, 2);
        let report = count(&mut tree, &soup).unwrap();
        assert!(report.in_domain);
        assert_eq!(report.triangles, 1);
    }

    #[test]
    fn spanning_triangle_is_counted_in_each_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let soup = dir.path().join("soup");
        // corners in two opposite octants
        write_soup(
            &soup,
            &[[
                Vector3::new(0.01, 0.01, 0.01),
                Vector3::new(0.99, 0.99, 0.99),
                Vector3::new(0.01, 0.99, 0.01),
            ]],
        );
        let mut tree =
            Octree::with_bounds(Vector3::zeros(), Vector3::from_element(1.0), 1);
        count(&mut tree, &soup).unwrap();
        tree.assign_leaf_indices().unwrap();
        assert_eq!(tree.leaf_count(), 3);
        let total: u32 = tree.leaves().map(|id| tree.node(id).tn).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn dispatch_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let soup = dir.path().join("soup");
        write_soup(
            &soup,
            &[
                corner_triangle(0.1, 0.1, 0.1),
                corner_triangle(0.9, 0.9, 0.9),
                [
                    Vector3::new(0.1, 0.1, 0.1),
                    Vector3::new(0.9, 0.9, 0.9),
                    Vector3::new(0.9, 0.1, 0.1),
                ],
            ],
        );
        let mut tree =
            Octree::with_bounds(Vector3::zeros(), Vector3::from_element(1.0), 1);
        count(&mut tree, &soup).unwrap();
        let data = dir.path().join("dispatched");
        let structure = dir.path().join("intermediate");
        dispatch(&mut tree, &soup, &data, &structure).unwrap();

        let (loaded, data_path) = load_intermediate(&structure).unwrap();
        assert_eq!(data_path, data);
        assert_eq!(loaded.leaf_count(), tree.leaf_count());
        assert_eq!(loaded.scale, tree.scale);

        let file = File::open(&data_path).unwrap();
        let mut spanning = 0;
        for id in loaded.leaves() {
            let node = loaded.node(id);
            let mut r =
                RegionReader::open(&file, node.size, node.ijk, node.counter, node.tn)
                    .unwrap();
            while let Some(rec) = r.next_record().unwrap() {
                if rec.group() == 2 {
                    spanning += 1;
                }
                // every corner of every record is on the grid
                for i in 0..3 {
                    assert!(Octree::in_domain(rec.vertex(i)));
                }
            }
        }
        // the spanning triangle appears once per touched leaf
        assert_eq!(spanning, 3);
    }
}
