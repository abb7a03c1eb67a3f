use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of a device named in a placement.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum DeviceKind {
    /// Host memory.
    Cpu,
    /// A CUDA device.
    Cuda,
    /// Any other device kind, stored by its lower-case name.
    Other(String),
}

impl DeviceKind {
    /// The name of the device kind, as written in a placement.
    pub fn as_str(&self) -> &str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::Other(name) => name,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device such as `cpu`, `cuda` or `cuda:1`.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DeviceSpec {
    kind: DeviceKind,
    index: Option<usize>,
}

impl DeviceSpec {
    /// Creates a new [`DeviceSpec`].
    pub fn new(kind: DeviceKind, index: Option<usize>) -> Self {
        Self { kind, index }
    }

    /// Shorthand for `cpu:<index>`.
    pub fn cpu(index: usize) -> Self {
        Self::new(DeviceKind::Cpu, Some(index))
    }

    /// Shorthand for `cuda:<index>`.
    pub fn cuda(index: usize) -> Self {
        Self::new(DeviceKind::Cuda, Some(index))
    }

    /// The device kind.
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// The device index, if one was given.
    pub fn index(&self) -> Option<usize> {
        self.index
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{}", self.kind, index),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = PlacementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, index) = match s.split_once(':') {
            Some((kind, index)) => {
                let index = index
                    .parse::<usize>()
                    .map_err(|_| PlacementError::InvalidDeviceIndex(index.to_string()))?;
                (kind, Some(index))
            }
            None => (s, None),
        };

        if kind.is_empty() {
            return Err(PlacementError::EmptyDeviceKind);
        }

        // Device kinds are case-insensitive and always printed in lowercase.
        let kind = match kind.to_lowercase().as_str() {
            "cpu" => DeviceKind::Cpu,
            "cuda" => DeviceKind::Cuda,
            other => DeviceKind::Other(other.to_string()),
        };

        Ok(Self { kind, index })
    }
}

/// The participant a placement refers to.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum PlacementTarget {
    /// A process rank in the process group.
    Rank(usize),
    /// A named worker. Resolving worker names needs an RPC layer.
    Worker(String),
    /// No target was given, the device is local to the caller.
    Local,
}

/// A remote device descriptor, written `rank:<n>/<device>`, `<worker>/<device>`
/// or `<device>`.
///
/// # Example
///
/// ```rust
/// use burn_sharded::{DeviceSpec, Placement};
///
/// let placement: Placement = "rank:1/cuda:1".parse().unwrap();
/// assert_eq!(placement.rank(), Some(1));
/// assert_eq!(placement.device(), &DeviceSpec::cuda(1));
/// assert_eq!(placement.to_string(), "rank:1/cuda:1");
/// ```
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Placement {
    target: PlacementTarget,
    device: DeviceSpec,
}

impl Placement {
    /// Creates a placement on the given rank.
    pub fn on_rank(rank: usize, device: DeviceSpec) -> Self {
        Self {
            target: PlacementTarget::Rank(rank),
            device,
        }
    }

    /// Parses a placement from its string form.
    pub fn parse(s: &str) -> Result<Self, PlacementError> {
        s.parse()
    }

    /// The rank this placement refers to, if it names one.
    pub fn rank(&self) -> Option<usize> {
        match self.target {
            PlacementTarget::Rank(rank) => Some(rank),
            _ => None,
        }
    }

    /// The placement target.
    pub fn target(&self) -> &PlacementTarget {
        &self.target
    }

    /// The device on the target.
    pub fn device(&self) -> &DeviceSpec {
        &self.device
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            PlacementTarget::Rank(rank) => write!(f, "rank:{}/{}", rank, self.device),
            PlacementTarget::Worker(name) => write!(f, "{}/{}", name, self.device),
            PlacementTarget::Local => write!(f, "{}", self.device),
        }
    }
}

impl FromStr for Placement {
    type Err = PlacementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PlacementError::Empty);
        }

        let mut parts = s.split('/');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        if parts.next().is_some() {
            return Err(PlacementError::TooManySeparators(s.to_string()));
        }

        let Some(device) = second else {
            return Ok(Self {
                target: PlacementTarget::Local,
                device: first.parse()?,
            });
        };

        let target = match first.strip_prefix("rank:") {
            Some(rank) => PlacementTarget::Rank(
                rank.parse::<usize>()
                    .map_err(|_| PlacementError::InvalidRank(rank.to_string()))?,
            ),
            None if first.is_empty() => return Err(PlacementError::EmptyWorkerName),
            None => {
                if !first
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(PlacementError::InvalidWorkerName(first.to_string()));
                }
                PlacementTarget::Worker(first.to_string())
            }
        };

        Ok(Self {
            target,
            device: device.parse()?,
        })
    }
}

impl TryFrom<String> for Placement {
    type Error = PlacementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<&str> for Placement {
    type Error = PlacementError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Placement> for String {
    fn from(value: Placement) -> Self {
        value.to_string()
    }
}

/// Errors raised while parsing a [`Placement`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// The placement string was empty.
    #[error("placement must not be empty")]
    Empty,
    /// The placement string had more than one `/`.
    #[error("placement '{0}' has more than one '/' separator")]
    TooManySeparators(String),
    /// The rank after `rank:` is not a non-negative integer.
    #[error("invalid rank '{0}'")]
    InvalidRank(String),
    /// The worker name before `/` is empty.
    #[error("worker name must not be empty")]
    EmptyWorkerName,
    /// The worker name contains characters other than alphanumerics, `_` or `-`.
    #[error("invalid worker name '{0}'")]
    InvalidWorkerName(String),
    /// The device kind is empty.
    #[error("device kind must not be empty")]
    EmptyDeviceKind,
    /// The device index is not a non-negative integer.
    #[error("invalid device index '{0}'")]
    InvalidDeviceIndex(String),
}
