//! Sharding specifications and the shard metadata they produce.

mod metadata;
mod spec;

pub use metadata::*;
pub use spec::*;


use crate::PlacementError;

/// Represents errors that can occur when building or validating a sharding layout.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardingError {
    /// A spec was given no placements or shards.
    #[error("sharding spec needs at least one placement")]
    EmptyPlacements,
    /// The same placement appears twice in a chunk spec.
    #[error("placement '{0}' appears more than once")]
    DuplicatePlacement(String),
    /// A placement failed to parse.
    #[error(transparent)]
    Placement(#[from] PlacementError),
    /// The sharded dimension does not exist in the tensor.
    #[error("sharding dim {dim} is out of range for a tensor with {ndim} dimension(s)")]
    InvalidDim {
        /// The requested dimension.
        dim: ShardDim,
        /// Number of dimensions of the tensor.
        ndim: usize,
    },
    /// Shard offsets and sizes have different lengths.
    #[error("shard has {offsets} offset(s) but {sizes} size(s)")]
    OffsetsSizesMismatch {
        /// Number of offsets.
        offsets: usize,
        /// Number of sizes.
        sizes: usize,
    },
    /// A shard's dimensionality differs from the others or from the tensor.
    #[error("shard #{shard} has {ndim} dimension(s), expected {expected}")]
    ShardRankMismatch {
        /// Index of the offending shard.
        shard: usize,
        /// Its number of dimensions.
        ndim: usize,
        /// The expected number of dimensions.
        expected: usize,
    },
    /// Two shards cover a common region.
    #[error("shards #{first} and #{second} overlap")]
    Overlap {
        /// Index of the first shard.
        first: usize,
        /// Index of the second shard.
        second: usize,
    },
    /// A shard extends past the tensor.
    #[error("shard #{shard} ends at {end} in dim {dim}, but the tensor size is {size}")]
    OutOfBounds {
        /// Index of the offending shard.
        shard: usize,
        /// The dimension that overflows.
        dim: usize,
        /// End of the shard in that dimension.
        end: usize,
        /// Size of the tensor in that dimension.
        size: usize,
    },
    /// A shard's extent does not fit in `usize`.
    #[error("shard #{shard} overflows in dim {dim}")]
    ExtentOverflow {
        /// Index of the offending shard.
        shard: usize,
        /// The dimension whose end or volume overflows.
        dim: usize,
    },
    /// The shards do not cover the whole tensor.
    #[error("shards cover {shards} element(s), but the tensor has {tensor}")]
    VolumeMismatch {
        /// Total volume of the shards.
        shards: usize,
        /// Volume of the tensor.
        tensor: usize,
    },
}
