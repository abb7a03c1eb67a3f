//! Process groups and the collectives sharded tensors are built on.

mod backend;
mod group;

pub use backend::*;
pub use group::*;

/// Errors raised by collective operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// The backend name is not recognized.
    #[error("unknown communication backend '{0}'")]
    UnknownBackend(String),
    /// The backend is not available in this build.
    #[error("communication backend '{0}' is not available")]
    BackendUnavailable(CommBackend),
    /// A process group needs at least one rank.
    #[error("process group needs at least one rank")]
    EmptyGroup,
    /// A rank argument is outside the group.
    #[error("rank {rank} is out of range for world size {world_size}")]
    InvalidRank {
        /// The offending rank.
        rank: usize,
        /// Size of the group.
        world_size: usize,
    },
    /// No message arrived from a peer within the group timeout.
    #[error("timed out waiting for rank {src} in collective #{seq}")]
    Timeout {
        /// The rank we were waiting for.
        src: usize,
        /// Sequence number of the collective.
        seq: u64,
    },
    /// A peer dropped its end of the group.
    #[error("rank {peer} disconnected")]
    Disconnected {
        /// The rank that went away.
        peer: usize,
    },
    /// A peer sent a payload of a different type than expected.
    #[error("rank {src} sent a payload of an unexpected type in collective #{seq}")]
    TypeMismatch {
        /// The sending rank.
        src: usize,
        /// Sequence number of the collective.
        seq: u64,
    },
    /// The root of a scatter or broadcast did not provide its payload.
    #[error("rank {rank} is the root but provided no payload")]
    MissingRootPayload {
        /// The root rank.
        rank: usize,
    },
    /// Scatter needs exactly one value per rank.
    #[error("scatter needs {expected} value(s), got {actual}")]
    ScatterLength {
        /// World size.
        expected: usize,
        /// Values provided.
        actual: usize,
    },
}
