//! Module containing the universal error type for this crate
use thiserror::Error;

/// Universal error type for out-of-core mesh processing
#[derive(Error, Debug)]
pub enum Error {
    /// No octant of the requested size contains this point
    #[error("no octant contains this point")]
    OctantNotFound,

    /// Point lies outside the integer coordinate grid
    ///
    /// During triangle counting this is recoverable: the caller rebuilds the
    /// octree from the discovered bounding box and runs the pass again.
    /// Everywhere else it is fatal.
    #[error("point lies outside the octree domain")]
    OutsideDomain,

    /// A leaf has more than 256 adjacent leaves
    ///
    /// Adjacency records store single-byte indices into the per-leaf
    /// adjacency table, so the table is capped at 256 entries.
    #[error("leaf {0} has more than 256 adjacent leaves")]
    AdjacencyOverflow(u32),

    /// A leaf's reserved global index range is exhausted
    #[error("leaf {leaf} cannot hold vertex {label}: reserved index range is full")]
    IndexCapacityExceeded {
        /// Leaf that ran out of reserved labels
        leaf: u32,
        /// Label of the vertex that could not be stored
        label: u32,
    },

    /// A non-writable vertex was moved outside its owning leaf
    #[error("vertex {0} moved outside its leaf but is not writable")]
    MovedNonWritable(u32),

    /// An operation required a leaf which is not part of the loaded set
    #[error("leaf {0} is not loaded")]
    LeafNotLoaded(u32),

    /// On-disk data does not match what the octree expects
    #[error("bad on-disk data: {0}")]
    BadFormat(&'static str),

    /// Unsupported version in a structure file
    #[error("unsupported format version {0}")]
    BadVersion(u32),

    /// IO error; see inner code for details
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}
