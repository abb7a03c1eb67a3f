use burn_tensor::{ElementConversion, Shape, Tensor, TensorData, backend::Backend};

use super::creation::{build_checked_metadata, owning_rank, resolve_device};
use super::{Shard, ShardedTensor};
use crate::sharding::{ShardMetadata, ShardingSpec};
use crate::{DistContext, ShardError};

impl<B: Backend, const D: usize> ShardedTensor<B, D> {
    /// Assembles the full tensor on rank `dst`.
    ///
    /// This is a collective. Rank `dst` gets `Some(tensor)`, placed on the device of
    /// its first local shard, while every other rank gets `None`.
    pub fn gather(&self, dst: usize) -> Result<Option<Tensor<B, D>>, ShardError> {
        let local: Vec<(ShardMetadata, TensorData)> = self
            .local_shards()
            .iter()
            .map(|shard| (shard.metadata.clone(), shard.tensor.to_data()))
            .collect();

        let Some(gathered) = self.context().group().gather(local, dst)? else {
            return Ok(None);
        };

        let size = &self.metadata().size;
        let mut values = vec![B::FloatElem::from_elem(0.0); size.iter().product()];

        for (metadata, data) in gathered.into_iter().flatten() {
            let shard_values = data
                .to_vec::<B::FloatElem>()
                .map_err(|err| ShardError::Data(format!("{err:?}")))?;
            copy_block(
                &mut values,
                size,
                &metadata.shard_offsets,
                &metadata.shard_sizes,
                &shard_values,
            );
        }

        let device = self
            .local_shards()
            .first()
            .map(|shard| shard.tensor.device())
            .unwrap_or_default();

        log::debug!("Rank {dst} gathered sharded tensor {:?}", size);

        Ok(Some(Tensor::from_data(
            TensorData::new(values, size.clone()),
            &device,
        )))
    }

    /// Shards `tensor`, held by rank `src`, across the group according to `spec`.
    ///
    /// This is a collective. Only `src` provides the tensor, the other ranks pass
    /// `None` and receive their shards from `src`.
    pub fn scatter_from(
        tensor: Option<Tensor<B, D>>,
        src: usize,
        spec: impl Into<ShardingSpec>,
        context: &DistContext<B>,
    ) -> Result<Self, ShardError> {
        let spec = spec.into();
        let group = context.group();

        let dims = group.broadcast(tensor.as_ref().map(|tensor| tensor.dims().to_vec()), src)?;
        let metadata = build_checked_metadata(&spec, Shape::from(dims), D, context)?;

        let pieces = match tensor {
            Some(tensor) if group.rank() == src => {
                let mut per_rank: Vec<Vec<(usize, TensorData)>> =
                    (0..group.world_size()).map(|_| Vec::new()).collect();

                for (idx, shard) in metadata.shards_metadata.iter().enumerate() {
                    let rank = owning_rank(shard, context)?;
                    per_rank[rank].push((idx, narrow_to_shard(&tensor, shard)));
                }

                Some(per_rank)
            }
            _ => None,
        };

        let received = group.scatter(pieces, src)?;

        let local_shards = received
            .into_iter()
            .map(|(idx, data)| {
                let shard = &metadata.shards_metadata[idx];
                let device = resolve_device(shard, context)?;

                Ok(Shard {
                    tensor: Tensor::from_data(data, &device),
                    metadata: shard.clone(),
                })
            })
            .collect::<Result<Vec<_>, ShardError>>()?;

        Ok(Self::from_parts(
            local_shards,
            spec,
            metadata,
            context.clone(),
        ))
    }
}

fn narrow_to_shard<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    shard: &ShardMetadata,
) -> TensorData {
    if shard.volume() == 0 {
        return TensorData::new(Vec::<B::FloatElem>::new(), shard.shard_sizes.clone());
    }

    shard
        .ranges()
        .into_iter()
        .enumerate()
        .fold(tensor.clone(), |piece, (dim, range)| {
            piece.narrow(dim, range.start, range.len())
        })
        .into_data()
}

/// Copies a row-major block of shape `sizes` into a row-major buffer of shape `dims`,
/// starting at `offsets`.
fn copy_block<E: Copy>(dst: &mut [E], dims: &[usize], offsets: &[usize], sizes: &[usize], src: &[E]) {
    let Some((&row_len, outer)) = sizes.split_last() else {
        return;
    };
    let rows = outer.iter().product::<usize>();
    if row_len == 0 || rows == 0 {
        return;
    }

    let mut strides = vec![1; dims.len()];
    for dim in (0..dims.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * dims[dim + 1];
    }

    for row in 0..rows {
        let mut remainder = row;
        let mut start = offsets[outer.len()];
        for dim in (0..outer.len()).rev() {
            let coord = remainder % outer[dim];
            remainder /= outer[dim];
            start += (offsets[dim] + coord) * strides[dim];
        }

        dst[start..start + row_len].copy_from_slice(&src[row * row_len..(row + 1) * row_len]);
    }
}
