use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::CommError;

/// The transport used by a [`ProcessGroup`](super::ProcessGroup).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommBackend {
    /// In-process channels between rank threads.
    #[default]
    Local,
    /// Gloo over TCP.
    Gloo,
    /// NVIDIA's collective library.
    Nccl,
}

impl CommBackend {
    /// Whether this build can create process groups on the backend.
    pub fn is_available(&self) -> bool {
        matches!(self, CommBackend::Local)
    }

    /// The lower-case backend name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommBackend::Local => "local",
            CommBackend::Gloo => "gloo",
            CommBackend::Nccl => "nccl",
        }
    }
}

impl fmt::Display for CommBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommBackend {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(CommBackend::Local),
            "gloo" => Ok(CommBackend::Gloo),
            "nccl" => Ok(CommBackend::Nccl),
            _ => Err(CommError::UnknownBackend(s.to_string())),
        }
    }
}
