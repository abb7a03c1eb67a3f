use std::sync::Arc;

use burn_tensor::backend::Backend;

use crate::comm::ProcessGroup;
use crate::device::DeviceResolver;
use crate::{Placement, ShardError};

/// What a rank needs to build and operate on sharded tensors: its process group
/// and a way to map placements to backend devices.
pub struct DistContext<B: Backend> {
    group: Arc<ProcessGroup>,
    devices: Arc<dyn DeviceResolver<B>>,
}

impl<B: Backend> DistContext<B> {
    /// Creates a new context.
    pub fn new(group: Arc<ProcessGroup>, devices: Arc<dyn DeviceResolver<B>>) -> Self {
        Self { group, devices }
    }

    /// A context for a single rank that owns every placement.
    pub fn single(devices: Arc<dyn DeviceResolver<B>>) -> Self {
        Self::new(Arc::new(ProcessGroup::single()), devices)
    }

    /// The caller's rank.
    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    /// Number of ranks in the group.
    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    /// The process group.
    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    /// The device resolver.
    pub fn devices(&self) -> &dyn DeviceResolver<B> {
        self.devices.as_ref()
    }

    /// The rank a placement refers to, checked against the group.
    pub fn placement_rank(&self, placement: &Placement) -> Result<usize, ShardError> {
        let rank = placement
            .rank()
            .ok_or_else(|| ShardError::UnresolvedPlacement(placement.to_string()))?;

        if rank >= self.world_size() {
            return Err(ShardError::PlacementRankOutOfRange {
                rank,
                world_size: self.world_size(),
            });
        }

        Ok(rank)
    }

    /// The backend device a placement refers to.
    pub fn resolve_device(&self, placement: &Placement) -> Result<B::Device, ShardError> {
        self.devices.resolve(placement.device())
    }
}

impl<B: Backend> Clone for DistContext<B> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            devices: self.devices.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for DistContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistContext")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}
