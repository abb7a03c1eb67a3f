use burn_tensor::{Distribution, ElementConversion, Shape, Tensor, TensorData, backend::Backend};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{Shard, ShardedTensor};
use crate::sharding::{ShardMetadata, ShardedTensorMetadata, ShardingSpec};
use crate::{DistContext, ShardError};

impl<B: Backend, const D: usize> ShardedTensor<B, D> {
    /// Creates a sharded tensor with uninitialized values.
    pub fn empty<S: Into<Shape>>(
        spec: impl Into<ShardingSpec>,
        shape: S,
        context: &DistContext<B>,
    ) -> Result<Self, ShardError> {
        Self::create_with(spec, shape, context, |_, sizes, device| {
            Tensor::empty(sizes, device)
        })
    }

    /// Creates a sharded tensor filled with zeros.
    pub fn zeros<S: Into<Shape>>(
        spec: impl Into<ShardingSpec>,
        shape: S,
        context: &DistContext<B>,
    ) -> Result<Self, ShardError> {
        Self::create_with(spec, shape, context, |_, sizes, device| {
            Tensor::zeros(sizes, device)
        })
    }

    /// Creates a sharded tensor filled with ones.
    pub fn ones<S: Into<Shape>>(
        spec: impl Into<ShardingSpec>,
        shape: S,
        context: &DistContext<B>,
    ) -> Result<Self, ShardError> {
        Self::create_with(spec, shape, context, |_, sizes, device| {
            Tensor::ones(sizes, device)
        })
    }

    /// Creates a sharded tensor filled with `value`.
    pub fn full<S: Into<Shape>, E: ElementConversion + Copy>(
        spec: impl Into<ShardingSpec>,
        shape: S,
        value: E,
        context: &DistContext<B>,
    ) -> Result<Self, ShardError> {
        Self::create_with(spec, shape, context, |_, sizes, device| {
            Tensor::full(sizes, value, device)
        })
    }

    /// Creates a sharded tensor with values drawn uniformly from `[0, 1)`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let spec = ChunkShardingSpec::new(0, ["rank:0/cpu:0", "rank:1/cpu:1"])?;
    /// let st = ShardedTensor::<B, 2>::rand(spec, [12, 5], &context)?;
    ///
    /// // Each rank holds a [6, 5] chunk.
    /// assert_eq!(st.local_tensor()?.dims(), [6, 5]);
    /// ```
    pub fn rand<S: Into<Shape>>(
        spec: impl Into<ShardingSpec>,
        shape: S,
        context: &DistContext<B>,
    ) -> Result<Self, ShardError> {
        Self::create_with(spec, shape, context, |_, sizes, device| {
            Tensor::random(sizes, Distribution::Default, device)
        })
    }

    /// Creates a sharded tensor with values drawn from a standard normal distribution.
    pub fn randn<S: Into<Shape>>(
        spec: impl Into<ShardingSpec>,
        shape: S,
        context: &DistContext<B>,
    ) -> Result<Self, ShardError> {
        Self::create_with(spec, shape, context, |_, sizes, device| {
            Tensor::random(sizes, Distribution::Normal(0.0, 1.0), device)
        })
    }

    /// Creates a sharded tensor with values drawn uniformly from `[0, 1)` by a
    /// generator seeded from `seed` and the shard index.
    ///
    /// The values of a shard only depend on the seed and the layout, not on the rank
    /// creating it.
    pub fn rand_seeded<S: Into<Shape>>(
        spec: impl Into<ShardingSpec>,
        shape: S,
        seed: u64,
        context: &DistContext<B>,
    ) -> Result<Self, ShardError> {
        Self::create_with(spec, shape, context, |idx, sizes, device| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(idx as u64));
            let values: Vec<f32> = (0..sizes.num_elements())
                .map(|_| rng.random::<f32>())
                .collect();

            Tensor::from_data(TensorData::new(values, sizes.dims), device)
        })
    }

    fn create_with<S, F>(
        spec: impl Into<ShardingSpec>,
        shape: S,
        context: &DistContext<B>,
        mut init: F,
    ) -> Result<Self, ShardError>
    where
        S: Into<Shape>,
        F: FnMut(usize, Shape, &B::Device) -> Tensor<B, D>,
    {
        let spec = spec.into();
        let metadata = build_checked_metadata(&spec, shape.into(), D, context)?;
        let rank = context.rank();

        let mut local_shards = Vec::new();
        for (idx, shard) in metadata.shards_metadata.iter().enumerate() {
            if shard.rank() != Some(rank) {
                continue;
            }

            let device = resolve_device(shard, context)?;
            let tensor = init(idx, Shape::from(shard.shard_sizes.clone()), &device);
            local_shards.push(Shard {
                tensor,
                metadata: shard.clone(),
            });
        }

        log::debug!(
            "Rank {rank} created {} local shard(s) of sharded tensor {:?}",
            local_shards.len(),
            metadata.size
        );

        Ok(Self::from_parts(local_shards, spec, metadata, context.clone()))
    }
}

/// Builds the metadata of `spec` for `shape` and checks every shard names a rank of
/// the group.
pub(crate) fn build_checked_metadata<B: Backend>(
    spec: &ShardingSpec,
    shape: Shape,
    ndim: usize,
    context: &DistContext<B>,
) -> Result<ShardedTensorMetadata, ShardError> {
    if shape.num_dims() != ndim {
        return Err(ShardError::DimMismatch {
            expected: ndim,
            actual: shape.num_dims(),
        });
    }

    let metadata = spec.build_metadata(&shape.dims)?;
    for shard in &metadata.shards_metadata {
        owning_rank(shard, context)?;
    }

    Ok(metadata)
}

/// The rank owning a shard, checked against the group.
pub(crate) fn owning_rank<B: Backend>(
    shard: &ShardMetadata,
    context: &DistContext<B>,
) -> Result<usize, ShardError> {
    let placement = shard
        .placement
        .as_ref()
        .ok_or_else(|| ShardError::UnresolvedPlacement(String::from("<none>")))?;

    context.placement_rank(placement)
}

pub(crate) fn resolve_device<B: Backend>(
    shard: &ShardMetadata,
    context: &DistContext<B>,
) -> Result<B::Device, ShardError> {
    match &shard.placement {
        Some(placement) => context.resolve_device(placement),
        None => Err(ShardError::UnresolvedPlacement(String::from("<none>"))),
    }
}
