use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::ShardingError;
use crate::Placement;

/// Describes a single shard: the hyper-rectangle of the global tensor it covers
/// and where it lives.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardMetadata {
    /// Offset of the shard in each dimension of the global tensor.
    pub shard_offsets: Vec<usize>,
    /// Size of the shard in each dimension.
    pub shard_sizes: Vec<usize>,
    /// Where the shard is stored.
    pub placement: Option<Placement>,
}

impl ShardMetadata {
    /// Creates a new [`ShardMetadata`].
    pub fn new(
        shard_offsets: Vec<usize>,
        shard_sizes: Vec<usize>,
        placement: Option<Placement>,
    ) -> Result<Self, ShardingError> {
        if shard_offsets.len() != shard_sizes.len() {
            return Err(ShardingError::OffsetsSizesMismatch {
                offsets: shard_offsets.len(),
                sizes: shard_sizes.len(),
            });
        }

        Ok(Self {
            shard_offsets,
            shard_sizes,
            placement,
        })
    }

    /// Number of dimensions of the shard.
    pub fn ndim(&self) -> usize {
        self.shard_sizes.len()
    }

    /// Number of elements in the shard.
    pub fn volume(&self) -> usize {
        self.shard_sizes.iter().product()
    }

    /// The rank owning this shard, if its placement names one.
    pub fn rank(&self) -> Option<usize> {
        self.placement.as_ref().and_then(Placement::rank)
    }

    /// The ranges covered by the shard, one per dimension.
    ///
    /// Ends saturate at `usize::MAX`. [`validate_shards`] and [`check_tensor`]
    /// reject shards whose extent overflows.
    pub fn ranges(&self) -> Vec<Range<usize>> {
        self.shard_offsets
            .iter()
            .zip(&self.shard_sizes)
            .map(|(&offset, &size)| offset..offset.saturating_add(size))
            .collect()
    }

    /// Checks that every end offset and the volume fit in `usize`.
    fn check_extent(&self, shard: usize) -> Result<(), ShardingError> {
        let mut volume: usize = 1;

        for (dim, (&offset, &size)) in self.shard_offsets.iter().zip(&self.shard_sizes).enumerate() {
            let overflow = ShardingError::ExtentOverflow { shard, dim };
            offset.checked_add(size).ok_or(overflow.clone())?;
            volume = volume.checked_mul(size).ok_or(overflow)?;
        }

        Ok(())
    }

    fn overlaps(&self, other: &ShardMetadata) -> bool {
        self.ranges()
            .iter()
            .zip(other.ranges())
            .all(|(a, b)| a.start < b.end && b.start < a.end)
    }
}

/// Global metadata of a sharded tensor: every shard across all ranks plus the
/// logical shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardedTensorMetadata {
    /// Metadata of all shards, in placement order.
    pub shards_metadata: Vec<ShardMetadata>,
    /// Global shape of the tensor.
    pub size: Vec<usize>,
}

impl ShardedTensorMetadata {
    /// Shards owned by the given rank.
    pub fn shards_on_rank(&self, rank: usize) -> impl Iterator<Item = &ShardMetadata> {
        self.shards_metadata
            .iter()
            .filter(move |shard| shard.rank() == Some(rank))
    }
}

/// Ensures all shards have the same dimensionality and that no two shards overlap.
pub fn validate_shards(shards: &[ShardMetadata]) -> Result<(), ShardingError> {
    let Some(first) = shards.first() else {
        return Ok(());
    };

    for (idx, shard) in shards.iter().enumerate() {
        if shard.ndim() != first.ndim() {
            return Err(ShardingError::ShardRankMismatch {
                shard: idx,
                ndim: shard.ndim(),
                expected: first.ndim(),
            });
        }
        shard.check_extent(idx)?;
    }

    // Shard counts are bounded by the world size, pairwise is fine.
    for i in 0..shards.len() {
        for j in (i + 1)..shards.len() {
            if shards[i].overlaps(&shards[j]) {
                return Err(ShardingError::Overlap {
                    first: i,
                    second: j,
                });
            }
        }
    }

    Ok(())
}

/// Ensures the shards fit inside a tensor of the given shape and cover all of it.
///
/// Must be called on shards that passed [`validate_shards`], otherwise
/// overlapping shards could compensate for a hole.
pub fn check_tensor(shards: &[ShardMetadata], tensor_dims: &[usize]) -> Result<(), ShardingError> {
    let mut volume: usize = 0;

    for (idx, shard) in shards.iter().enumerate() {
        if shard.ndim() != tensor_dims.len() {
            return Err(ShardingError::ShardRankMismatch {
                shard: idx,
                ndim: shard.ndim(),
                expected: tensor_dims.len(),
            });
        }
        shard.check_extent(idx)?;

        for (dim, (range, &size)) in shard.ranges().iter().zip(tensor_dims).enumerate() {
            if range.end > size {
                return Err(ShardingError::OutOfBounds {
                    shard: idx,
                    dim,
                    end: range.end,
                    size,
                });
            }
        }

        volume = volume.saturating_add(shard.volume());
    }

    let expected = tensor_dims.iter().product::<usize>();
    if volume != expected {
        return Err(ShardingError::VolumeMismatch {
            shards: volume,
            tensor: expected,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(offsets: [usize; 2], sizes: [usize; 2]) -> ShardMetadata {
        ShardMetadata::new(offsets.to_vec(), sizes.to_vec(), None).unwrap()
    }

    #[test]
    fn test_grid_shards_are_valid() {
        let shards = vec![
            shard([0, 0], [2, 3]),
            shard([0, 3], [2, 2]),
            shard([2, 0], [2, 3]),
            shard([2, 3], [2, 2]),
        ];

        validate_shards(&shards).unwrap();
        check_tensor(&shards, &[4, 5]).unwrap();
    }

    #[test]
    fn test_overlapping_shards_are_rejected() {
        let shards = vec![shard([0, 0], [3, 5]), shard([2, 0], [2, 5])];

        assert_eq!(
            validate_shards(&shards),
            Err(ShardingError::Overlap {
                first: 0,
                second: 1
            })
        );
    }

    #[test]
    fn test_touching_and_empty_shards_do_not_overlap() {
        let shards = vec![
            shard([0, 0], [3, 5]),
            shard([3, 0], [3, 5]),
            shard([3, 0], [0, 5]),
        ];

        validate_shards(&shards).unwrap();
    }

    #[test]
    fn test_shard_out_of_bounds() {
        let shards = vec![shard([0, 0], [2, 5]), shard([2, 0], [3, 5])];

        assert_eq!(
            check_tensor(&shards, &[4, 5]),
            Err(ShardingError::OutOfBounds {
                shard: 1,
                dim: 0,
                end: 5,
                size: 4
            })
        );
    }

    #[test]
    fn test_shards_must_cover_tensor() {
        let shards = vec![shard([0, 0], [2, 5])];

        assert_eq!(
            check_tensor(&shards, &[4, 5]),
            Err(ShardingError::VolumeMismatch {
                shards: 10,
                tensor: 20
            })
        );
    }

    #[test]
    fn test_mixed_dimensionality_is_rejected() {
        let shards = vec![
            shard([0, 0], [2, 5]),
            ShardMetadata::new(vec![2], vec![2], None).unwrap(),
        ];

        assert_eq!(
            validate_shards(&shards),
            Err(ShardingError::ShardRankMismatch {
                shard: 1,
                ndim: 1,
                expected: 2
            })
        );
    }

    #[test]
    fn test_overflowing_shard_extent_is_an_error() {
        let shards = vec![ShardMetadata::new(vec![usize::MAX], vec![2], None).unwrap()];

        assert_eq!(
            check_tensor(&shards, &[4]),
            Err(ShardingError::ExtentOverflow { shard: 0, dim: 0 })
        );
        assert_eq!(
            validate_shards(&shards),
            Err(ShardingError::ExtentOverflow { shard: 0, dim: 0 })
        );
    }

    #[test]
    fn test_overflowing_shard_volume_is_an_error() {
        let shards = vec![
            shard([0, 0], [1, 1]),
            shard([0, 0], [usize::MAX / 2, 3]),
        ];

        assert_eq!(
            validate_shards(&shards),
            Err(ShardingError::ExtentOverflow { shard: 1, dim: 1 })
        );
    }

    #[test]
    fn test_offsets_and_sizes_must_match() {
        assert_eq!(
            ShardMetadata::new(vec![0, 0], vec![1], None),
            Err(ShardingError::OffsetsSizesMismatch {
                offsets: 2,
                sizes: 1
            })
        );
    }
}
