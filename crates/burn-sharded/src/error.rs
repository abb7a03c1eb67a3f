use crate::DeviceSpec;
use crate::comm::CommError;
use crate::sharding::ShardingError;

/// Errors raised by sharded tensor operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// The sharding layout is invalid.
    #[error(transparent)]
    Sharding(#[from] ShardingError),
    /// A collective failed.
    #[error(transparent)]
    Comm(#[from] CommError),
    /// The global shape has a different number of dimensions than the tensor type.
    #[error("shape has {actual} dimension(s), but the sharded tensor has {expected}")]
    DimMismatch {
        /// Rank of the tensor type.
        expected: usize,
        /// Length of the provided shape.
        actual: usize,
    },
    /// A placement names a worker instead of a rank.
    #[error("placement '{0}' does not name a rank")]
    UnresolvedPlacement(String),
    /// A placement names a rank outside the process group.
    #[error("placement rank {rank} is out of range for world size {world_size}")]
    PlacementRankOutOfRange {
        /// The placement's rank.
        rank: usize,
        /// Size of the process group.
        world_size: usize,
    },
    /// No device matches the placement on this host.
    #[error("device '{0}' is not available")]
    DeviceUnavailable(DeviceSpec),
    /// The caller's rank holds no shard.
    #[error("rank {rank} holds no local shard")]
    NoLocalShard {
        /// The caller's rank.
        rank: usize,
    },
    /// The caller's rank holds several shards where one is expected.
    #[error("only a single local shard is supported, rank {rank} holds {count}")]
    MultipleLocalShards {
        /// The caller's rank.
        rank: usize,
        /// Number of local shards.
        count: usize,
    },
    /// A local shard is placed on another rank.
    #[error("local shard #{shard} on rank {rank} is placed on rank {placement:?}")]
    ForeignLocalShard {
        /// Index of the local shard.
        shard: usize,
        /// The caller's rank.
        rank: usize,
        /// The rank named by the shard's placement.
        placement: Option<usize>,
    },
    /// A local shard's tensor does not have the shape its metadata declares.
    #[error("local shard #{shard} has shape {actual:?}, but its metadata says {expected:?}")]
    LocalShardShape {
        /// Index of the local shard.
        shard: usize,
        /// Shape from the metadata.
        expected: Vec<usize>,
        /// Shape of the tensor.
        actual: Vec<usize>,
    },
    /// Two sharded tensors were combined but are not laid out identically.
    #[error("sharded tensors have different metadata")]
    MetadataMismatch,
    /// Tensor data could not be read back.
    #[error("tensor data error: {0}")]
    Data(String),
}
