//! Out-of-core storage for triangle meshes too large for memory
//!
//! The input is **triangle soup**: a flat file of triangles with no
//! connectivity, typically produced by surface samplers or by concatenating
//! meshed parts.  The crate converts such a file into a disk-resident
//! octree whose leaves are independently loadable mesh slices, then lets an
//! application load a handful of leaves, edit them, and write them back
//! without ever holding the whole mesh in memory.
//!
//! # Building an index
//!
//! [`build_index`] runs the full pipeline:
//!
//! 1. a counting pass snaps every corner onto a `2^30` integer grid and
//!    counts triangles per octant (rebuilding the octree once if the
//!    guessed bounding box turns out too small),
//! 2. [`aggregate`](aggregate::aggregate) merges underfull octants
//!    bottom-up, under a depth-skew bound that keeps neighborhoods small,
//! 3. [`dispatch`](dispatch::dispatch) sorts the soup into one contiguous
//!    disk region per leaf,
//! 4. [`index`](index::build) deduplicates vertices, reserves a disjoint
//!    global label range per leaf, assigns each triangle to the lowest-
//!    indexed leaf it touches, and records which leaves share vertices.
//!
//! Every pass streams: memory is bounded by the largest leaf, not by the
//! mesh.
//!
//! ```no_run
//! use oemm::{Settings, build_index};
//! # use std::path::Path;
//!
//! let tree = build_index(
//!     Path::new("mesh.soup"),
//!     Path::new("mesh.oemm"),
//!     &Settings::default(),
//! )?;
//! println!("{} leaves", tree.leaf_count());
//! # Ok::<(), oemm::Error>(())
//! ```
//!
//! # Partial load and save
//!
//! [`storage::read_structure`] rebuilds the octree shell from disk without
//! touching any leaf data.  A [`MeshReader`] then loads a chosen set of
//! leaves into a [`Mesh`]; triangles crossing into unloaded leaves come
//! along as read-only geometry.  After editing, a [`MeshWriter`] saves the
//! same set back, moving vertices between loaded leaves as needed and
//! patching the files of unloaded neighbors whose triangles referenced
//! renumbered vertices.
#![warn(missing_docs)]

pub mod aggregate;
pub mod dedup;
pub mod dispatch;
mod error;
pub mod index;
pub mod mesh;
pub mod morton;
pub mod octree;
pub mod reader;
pub mod soup;
pub mod storage;
pub mod writer;

pub use error::Error;
pub use mesh::Mesh;
pub use octree::Octree;
pub use reader::MeshReader;
pub use writer::MeshWriter;

use log::{info, warn};
use nalgebra::Vector3;
use std::path::Path;

/// Tuning knobs for [`build_index`]
#[derive(Copy, Clone, Debug)]
pub struct Settings {
    /// Depth at which the counting pass creates octants; deeper means
    /// smaller initial cells for aggregation to work with
    pub level: u32,
    /// Ceiling on triangles per leaf when merging octants
    pub max_triangles: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            level: 8,
            max_triangles: 50_000,
        }
    }
}

/// Converts a triangle soup file into an indexed mesh directory
///
/// Scratch files created during dispatch are removed on success.  Returns
/// the indexed octree, which [`storage::read_structure`] can rebuild later
/// from the directory alone.
pub fn build_index(soup: &Path, out_dir: &Path, settings: &Settings) -> Result<Octree, Error> {
    std::fs::create_dir_all(out_dir)?;

    // the unit box is only a guess; one recount fixes it
    let mut tree = Octree::with_bounds(
        Vector3::zeros(),
        Vector3::from_element(1.0),
        settings.level,
    );
    let mut report = dispatch::count(&mut tree, soup)?;
    if !report.in_domain {
        info!(
            "recounting in {:?} .. {:?}",
            report.bbox_min, report.bbox_max
        );
        tree = Octree::with_bounds(report.bbox_min, report.bbox_max, settings.level);
        report = dispatch::count(&mut tree, soup)?;
        if !report.in_domain {
            return Err(Error::OutsideDomain);
        }
    }
    if report.triangles == 0 {
        warn!("soup file is empty");
    }

    aggregate::aggregate(&mut tree, settings.max_triangles)?;

    let data_file = out_dir.join("dispatched");
    let struct_file = out_dir.join("intermediate");
    dispatch::dispatch(&mut tree, soup, &data_file, &struct_file)?;
    drop(tree);

    // indexing restarts from disk alone, like a resumed run would
    let (mut tree, data) = dispatch::load_intermediate(&struct_file)?;
    index::build(&mut tree, &data, out_dir)?;

    std::fs::remove_file(&data_file)?;
    std::fs::remove_file(&struct_file)?;
    Ok(tree)
}
