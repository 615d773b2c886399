//! Deduplication maps from Morton keys to vertex indices
//!
//! Indexing streams billions of triangle corners and must hand out one local
//! index per distinct grid point.  Both maps here are AVL trees whose
//! `insert` returns the previously stored value when the key is already
//! present, so the caller learns in a single probe whether the vertex is new.
//!
//! [`avl::DedupTree`] stores one record per arena slot and is convenient for
//! the moderately sized per-leaf lookups of the triangle pass.
//! [`flat::FlatDedupTree`] packs records into a single growable `u64` array
//! with no per-node allocation, which is what the vertex pass uses when a
//! leaf holds hundreds of thousands of points.

pub mod avl;
pub mod flat;

pub use avl::DedupTree;
pub use flat::FlatDedupTree;
