#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn sharded tensors.
//!
//! A [`ShardedTensor`] is a logical tensor whose data is split across the ranks of a
//! process group according to a [sharding spec](sharding::ShardingSpec). Each rank
//! only holds its own shards, and operations that need a global view are collectives.

mod context;
mod device;
mod error;
mod placement;
mod tensor;

pub mod comm;
pub mod harness;
pub mod sharding;

pub use context::*;
pub use device::*;
pub use error::*;
pub use placement::*;
pub use tensor::*;
