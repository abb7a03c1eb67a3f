mod base;
mod creation;
mod gather;
mod shard;

pub use base::*;
pub use shard::*;
