use burn_tensor::{BasicOps, Float, Tensor, TensorKind, backend::Backend};

use crate::Placement;
use crate::sharding::{ShardMetadata, ShardingError};

/// A piece of a sharded tensor held by the current rank, with the metadata
/// locating it in the global tensor.
#[derive(Debug)]
pub struct Shard<B, const D: usize, K = Float>
where
    B: Backend,
    K: TensorKind<B>,
{
    /// Data of the shard.
    pub tensor: Tensor<B, D, K>,
    /// Where the shard sits in the global tensor.
    pub metadata: ShardMetadata,
}

impl<B, const D: usize, K> Shard<B, D, K>
where
    B: Backend,
    K: BasicOps<B>,
{
    /// Creates a shard from a local tensor and its offsets in the global tensor.
    /// The shard sizes are taken from the tensor.
    pub fn from_tensor_and_offsets(
        tensor: Tensor<B, D, K>,
        shard_offsets: [usize; D],
        placement: Placement,
    ) -> Result<Self, ShardingError> {
        let metadata = ShardMetadata::new(
            shard_offsets.to_vec(),
            tensor.dims().to_vec(),
            Some(placement),
        )?;

        Ok(Self { tensor, metadata })
    }

    pub(crate) fn dims_match_metadata(&self) -> bool {
        self.tensor.dims().as_slice() == self.metadata.shard_sizes.as_slice()
    }

    pub(crate) fn shape(&self) -> Vec<usize> {
        self.tensor.dims().to_vec()
    }
}

impl<B, const D: usize, K> Clone for Shard<B, D, K>
where
    B: Backend,
    K: TensorKind<B>,
{
    fn clone(&self) -> Self {
        Self {
            tensor: self.tensor.clone(),
            metadata: self.metadata.clone(),
        }
    }
}
