use std::sync::atomic::{AtomicU64, Ordering};

use burn_tensor::{BasicOps, Float, Shape, Tensor, TensorData, TensorKind, backend::Backend};

use super::Shard;
use crate::sharding::{EnumerableShardingSpec, ShardMetadata, ShardedTensorMetadata, ShardingSpec};
use crate::{DistContext, ShardError};

/// Identity of a sharded tensor within the process.
///
/// Handles obtained with [`Clone`] share the identity of the tensor they were cloned
/// from, while [`ShardedTensor::deep_copy`] always produces a fresh one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardedTensorId(u64);

impl ShardedTensorId {
    fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Represents a tensor that is distributed across the ranks of a process group.
///
/// A `ShardedTensor` holds the shards of a global tensor that belong to the current
/// rank, along with metadata describing every shard of the global tensor. The
/// distribution is defined by a [`ShardingSpec`], which maps each shard to a
/// placement (a rank and a device).
///
/// All ranks of the group must build the same sharded tensors in the same order,
/// since construction and several operations are collective.
pub struct ShardedTensor<B, const D: usize, K = Float>
where
    B: Backend,
    K: TensorKind<B>,
{
    id: ShardedTensorId,
    /// Shards owned by the current rank
    local_shards: Vec<Shard<B, D, K>>,
    /// Specification of how this tensor is sharded
    sharding_spec: ShardingSpec,
    /// Every shard across all ranks, and the global shape
    metadata: ShardedTensorMetadata,
    context: DistContext<B>,
}

impl<B, const D: usize, K> ShardedTensor<B, D, K>
where
    B: Backend,
    K: TensorKind<B>,
{
    pub(crate) fn from_parts(
        local_shards: Vec<Shard<B, D, K>>,
        sharding_spec: ShardingSpec,
        metadata: ShardedTensorMetadata,
        context: DistContext<B>,
    ) -> Self {
        Self {
            id: ShardedTensorId::new(),
            local_shards,
            sharding_spec,
            metadata,
            context,
        }
    }

    /// The identity of this tensor.
    pub fn id(&self) -> ShardedTensorId {
        self.id
    }

    /// Whether both handles refer to the same tensor.
    pub fn shares_identity(&self, other: &Self) -> bool {
        self.id == other.id
    }

    /// Shards owned by the current rank.
    pub fn local_shards(&self) -> &[Shard<B, D, K>] {
        &self.local_shards
    }

    /// Consumes the tensor, returning its local shards.
    pub fn into_local_shards(self) -> Vec<Shard<B, D, K>> {
        self.local_shards
    }

    /// The tensor of the single shard owned by the current rank.
    ///
    /// Fails when the rank owns no shard or more than one.
    pub fn local_tensor(&self) -> Result<&Tensor<B, D, K>, ShardError> {
        match self.local_shards.as_slice() {
            [shard] => Ok(&shard.tensor),
            [] => Err(ShardError::NoLocalShard { rank: self.rank() }),
            shards => Err(ShardError::MultipleLocalShards {
                rank: self.rank(),
                count: shards.len(),
            }),
        }
    }

    /// Metadata of every shard and the global shape.
    pub fn metadata(&self) -> &ShardedTensorMetadata {
        &self.metadata
    }

    /// How the tensor is sharded.
    pub fn sharding_spec(&self) -> &ShardingSpec {
        &self.sharding_spec
    }

    /// Global shape of the tensor.
    pub fn shape(&self) -> Shape {
        Shape::from(self.metadata.size.clone())
    }

    /// Global dimensions of the tensor.
    pub fn dims(&self) -> [usize; D] {
        let mut dims = [0; D];
        dims.copy_from_slice(&self.metadata.size);
        dims
    }

    /// The caller's rank.
    pub fn rank(&self) -> usize {
        self.context.rank()
    }

    /// The context the tensor was built in.
    pub fn context(&self) -> &DistContext<B> {
        &self.context
    }
}

impl<B, const D: usize, K> ShardedTensor<B, D, K>
where
    B: Backend,
    K: BasicOps<B>,
{
    /// Builds a sharded tensor from the shards each rank already holds.
    ///
    /// This is a collective: every rank contributes its shard metadata, and the
    /// gathered shards must tile `global_shape` without overlapping. When a rank
    /// provides an invalid shard, every rank returns that rank's error.
    pub fn init_from_local_shards<S: Into<Shape>>(
        local_shards: Vec<Shard<B, D, K>>,
        global_shape: S,
        context: &DistContext<B>,
    ) -> Result<Self, ShardError> {
        let global_shape = global_shape.into();
        let rank = context.rank();

        let local = check_local_shards(&local_shards, rank, global_shape.num_dims());
        let gathered = context.group().all_gather(local)?;

        let mut shards_metadata = Vec::new();
        for result in gathered {
            shards_metadata.extend(result?);
        }

        let spec = EnumerableShardingSpec::new(shards_metadata)?;
        let metadata = spec.build_metadata(&global_shape.dims)?;

        log::debug!(
            "Rank {rank} initialized sharded tensor {:?} from {} local shard(s)",
            metadata.size,
            local_shards.len()
        );

        Ok(Self::from_parts(
            local_shards,
            spec.into(),
            metadata,
            context.clone(),
        ))
    }

    /// Returns an independent copy of the tensor.
    ///
    /// The copy has the same type, layout and context, and equal local shard values.
    /// Its shards are backed by fresh storage and it has its own identity.
    pub fn deep_copy(&self) -> Self {
        let local_shards = self
            .local_shards
            .iter()
            .map(|shard| Shard {
                tensor: Tensor::from_data(shard.tensor.to_data(), &shard.tensor.device()),
                metadata: shard.metadata.clone(),
            })
            .collect();

        let copy = Self::from_parts(
            local_shards,
            self.sharding_spec.clone(),
            self.metadata.clone(),
            self.context.clone(),
        );
        log::trace!("Deep copied sharded tensor {:?} into {:?}", self.id, copy.id);

        copy
    }

    /// Copies the local shard values of `other` into this tensor.
    ///
    /// Both tensors must have the same metadata. The identity of `self` is kept.
    pub fn copy_from(&mut self, other: &Self) -> Result<(), ShardError> {
        if self.metadata != other.metadata || self.rank() != other.rank() {
            return Err(ShardError::MetadataMismatch);
        }

        for (shard, source) in self.local_shards.iter_mut().zip(&other.local_shards) {
            shard.tensor = Tensor::from_data(source.tensor.to_data(), &shard.tensor.device());
        }

        Ok(())
    }

    /// Whether both tensors have the same layout and values on every rank.
    ///
    /// This is a collective, every rank returns the same answer.
    pub fn equal(&self, other: &Self) -> Result<bool, ShardError> {
        let local = self.metadata == other.metadata
            && self.local_shards.len() == other.local_shards.len()
            && self
                .local_shards
                .iter()
                .zip(&other.local_shards)
                .all(|(lhs, rhs)| data_equal(&lhs.tensor.to_data(), &rhs.tensor.to_data()));

        let verdicts = self.context.group().all_gather(local)?;

        Ok(verdicts.into_iter().all(|verdict| verdict))
    }
}

impl<B, const D: usize, K> Clone for ShardedTensor<B, D, K>
where
    B: Backend,
    K: TensorKind<B>,
{
    /// Returns another handle on the same tensor, sharing its identity.
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            local_shards: self.local_shards.clone(),
            sharding_spec: self.sharding_spec.clone(),
            metadata: self.metadata.clone(),
            context: self.context.clone(),
        }
    }
}

impl<B, const D: usize, K> std::fmt::Debug for ShardedTensor<B, D, K>
where
    B: Backend,
    K: TensorKind<B>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedTensor")
            .field("id", &self.id)
            .field("size", &self.metadata.size)
            .field("rank", &self.rank())
            .field("local_shards", &self.local_shards.len())
            .finish()
    }
}

fn check_local_shards<B, const D: usize, K>(
    local_shards: &[Shard<B, D, K>],
    rank: usize,
    ndim: usize,
) -> Result<Vec<ShardMetadata>, ShardError>
where
    B: Backend,
    K: BasicOps<B>,
{
    if ndim != D {
        return Err(ShardError::DimMismatch {
            expected: D,
            actual: ndim,
        });
    }

    for (idx, shard) in local_shards.iter().enumerate() {
        let placement = shard.metadata.rank();
        if placement != Some(rank) {
            return Err(ShardError::ForeignLocalShard {
                shard: idx,
                rank,
                placement,
            });
        }

        if !shard.dims_match_metadata() {
            return Err(ShardError::LocalShardShape {
                shard: idx,
                expected: shard.metadata.shard_sizes.clone(),
                actual: shard.shape(),
            });
        }
    }

    Ok(local_shards
        .iter()
        .map(|shard| shard.metadata.clone())
        .collect())
}

pub(crate) fn data_equal(lhs: &TensorData, rhs: &TensorData) -> bool {
    lhs.shape == rhs.shape && lhs.dtype == rhs.dtype && lhs.as_bytes() == rhs.as_bytes()
}
