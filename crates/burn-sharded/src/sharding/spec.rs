use std::fmt;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use super::{ShardMetadata, ShardedTensorMetadata, ShardingError, check_tensor, validate_shards};
use crate::Placement;

/// The tensor dimension a [`ChunkShardingSpec`] splits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardDim {
    /// Counted from the first dimension.
    Index(usize),
    /// Counted from the last dimension, `FromEnd(1)` is the last one.
    FromEnd(usize),
}

impl ShardDim {
    /// Resolves the dimension against a tensor of `ndim` dimensions.
    pub fn resolve(self, ndim: usize) -> Option<usize> {
        match self {
            ShardDim::Index(dim) if dim < ndim => Some(dim),
            ShardDim::FromEnd(k) if k >= 1 && k <= ndim => Some(ndim - k),
            _ => None,
        }
    }
}

impl From<usize> for ShardDim {
    fn from(dim: usize) -> Self {
        ShardDim::Index(dim)
    }
}

impl fmt::Display for ShardDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardDim::Index(dim) => write!(f, "{dim}"),
            ShardDim::FromEnd(k) => write!(f, "-{k}"),
        }
    }
}

/// Splits one tensor dimension into contiguous chunks, one per placement.
///
/// With `n` placements, every chunk holds `ceil(size / n)` entries of the sharded
/// dimension, except trailing chunks which may be smaller or empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkShardingSpec {
    dim: ShardDim,
    placements: Vec<Placement>,
}

impl ChunkShardingSpec {
    /// Creates a chunk sharding spec from placement strings such as `"rank:0/cuda:0"`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn_sharded::sharding::ChunkShardingSpec;
    ///
    /// let spec = ChunkShardingSpec::new(
    ///     0,
    ///     ["rank:0/cuda:0", "rank:1/cuda:1", "rank:2/cuda:2", "rank:3/cuda:3"],
    /// )
    /// .unwrap();
    /// let metadata = spec.build_metadata(&[12, 5]).unwrap();
    ///
    /// assert_eq!(metadata.shards_metadata[1].shard_offsets, vec![3, 0]);
    /// assert_eq!(metadata.shards_metadata[1].shard_sizes, vec![3, 5]);
    /// ```
    pub fn new<D, I, S>(dim: D, placements: I) -> Result<Self, ShardingError>
    where
        D: Into<ShardDim>,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        placements
            .into_iter()
            .fold(ChunkShardingSpecBuilder::new(dim), |builder, placement| {
                builder.with_placement(placement.as_ref())
            })
            .build()
    }

    /// Returns a builder for a spec splitting `dim`.
    pub fn builder<D: Into<ShardDim>>(dim: D) -> ChunkShardingSpecBuilder {
        ChunkShardingSpecBuilder::new(dim)
    }

    /// The sharded dimension.
    pub fn dim(&self) -> ShardDim {
        self.dim
    }

    /// The placements, in chunk order.
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Computes the metadata of every chunk for a tensor of the given shape.
    pub fn build_metadata(&self, shape: &[usize]) -> Result<ShardedTensorMetadata, ShardingError> {
        // Deserialized specs skip the builder.
        if self.placements.is_empty() {
            return Err(ShardingError::EmptyPlacements);
        }

        let dim = self
            .dim
            .resolve(shape.len())
            .ok_or(ShardingError::InvalidDim {
                dim: self.dim,
                ndim: shape.len(),
            })?;

        let dim_size = shape[dim];
        let split_size = dim_size.div_ceil(self.placements.len());

        let shards_metadata = self
            .placements
            .iter()
            .enumerate()
            .map(|(idx, placement)| {
                let start = (split_size * idx).min(dim_size);
                let end = (split_size * (idx + 1)).min(dim_size);

                let mut shard_offsets = vec![0; shape.len()];
                let mut shard_sizes = shape.to_vec();
                shard_offsets[dim] = start;
                shard_sizes[dim] = end - start;

                ShardMetadata {
                    shard_offsets,
                    shard_sizes,
                    placement: Some(placement.clone()),
                }
            })
            .collect();

        Ok(ShardedTensorMetadata {
            shards_metadata,
            size: shape.to_vec(),
        })
    }
}

/// A builder for [`ChunkShardingSpec`].
///
/// Placements are parsed and validated when [`build`](Self::build) is called.
#[derive(Clone, Debug)]
pub struct ChunkShardingSpecBuilder {
    dim: ShardDim,
    placements: Vec<String>,
}

impl ChunkShardingSpecBuilder {
    /// Creates a new builder splitting `dim`.
    pub fn new<D: Into<ShardDim>>(dim: D) -> Self {
        Self {
            dim: dim.into(),
            placements: Vec::new(),
        }
    }

    /// Appends a placement. Chunks are assigned in the order placements are added.
    pub fn with_placement<S: AsRef<str>>(mut self, placement: S) -> Self {
        self.placements.push(placement.as_ref().to_string());
        self
    }

    /// Builds the [`ChunkShardingSpec`].
    ///
    /// Fails when no placement was given, when a placement does not parse, or when
    /// the same placement appears twice.
    pub fn build(self) -> Result<ChunkShardingSpec, ShardingError> {
        if self.placements.is_empty() {
            return Err(ShardingError::EmptyPlacements);
        }

        let mut seen = HashSet::new();
        let mut placements = Vec::with_capacity(self.placements.len());

        for raw in self.placements {
            let placement = Placement::parse(&raw)?;
            if !seen.insert(placement.clone()) {
                return Err(ShardingError::DuplicatePlacement(raw));
            }
            placements.push(placement);
        }

        Ok(ChunkShardingSpec {
            dim: self.dim,
            placements,
        })
    }
}

/// An explicit list of shards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerableShardingSpec {
    shards: Vec<ShardMetadata>,
}

impl EnumerableShardingSpec {
    /// Creates a spec from explicit shards. Shards must not overlap.
    pub fn new(shards: Vec<ShardMetadata>) -> Result<Self, ShardingError> {
        if shards.is_empty() {
            return Err(ShardingError::EmptyPlacements);
        }
        validate_shards(&shards)?;

        Ok(Self { shards })
    }

    /// The shards of the spec.
    pub fn shards(&self) -> &[ShardMetadata] {
        &self.shards
    }

    /// Checks the shards tile a tensor of the given shape and returns its metadata.
    pub fn build_metadata(&self, shape: &[usize]) -> Result<ShardedTensorMetadata, ShardingError> {
        check_tensor(&self.shards, shape)?;

        Ok(ShardedTensorMetadata {
            shards_metadata: self.shards.clone(),
            size: shape.to_vec(),
        })
    }
}

/// Describes how a tensor is distributed across ranks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardingSpec {
    /// Contiguous chunks along a single dimension.
    Chunk(ChunkShardingSpec),
    /// Explicitly listed shards.
    Enumerable(EnumerableShardingSpec),
}

impl ShardingSpec {
    /// Computes the metadata of every shard for a tensor of the given shape.
    pub fn build_metadata(&self, shape: &[usize]) -> Result<ShardedTensorMetadata, ShardingError> {
        match self {
            ShardingSpec::Chunk(spec) => spec.build_metadata(shape),
            ShardingSpec::Enumerable(spec) => spec.build_metadata(shape),
        }
    }

    /// Every placement named by the spec, in shard order.
    pub fn placements(&self) -> Vec<Option<&Placement>> {
        match self {
            ShardingSpec::Chunk(spec) => spec.placements.iter().map(Some).collect(),
            ShardingSpec::Enumerable(spec) => spec
                .shards
                .iter()
                .map(|shard| shard.placement.as_ref())
                .collect(),
        }
    }
}

impl From<ChunkShardingSpec> for ShardingSpec {
    fn from(spec: ChunkShardingSpec) -> Self {
        ShardingSpec::Chunk(spec)
    }
}

impl From<EnumerableShardingSpec> for ShardingSpec {
    fn from(spec: EnumerableShardingSpec) -> Self {
        ShardingSpec::Enumerable(spec)
    }
}
