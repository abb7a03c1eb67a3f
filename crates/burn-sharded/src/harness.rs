//! A runner for tests that need several cooperating ranks.
//!
//! Each rank runs on its own thread with its own [`DistContext`]. Requirements on
//! devices and backends are checked before any rank is started, and an unmet
//! requirement skips the test instead of failing it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use burn_tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::comm::{CommBackend, CommError, DEFAULT_TIMEOUT, ProcessGroup};
use crate::device::DeviceResolver;
use crate::{DeviceKind, DistContext, ShardError};

/// Number of devices the multi-rank sharding tests are written for.
pub const TEST_DEVICE_NUM: usize = 4;

/// Configuration of a [`MultiRankHarness`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Number of ranks to run.
    pub world_size: usize,
    /// Backend of the process group.
    pub backend: CommBackend,
    /// Whether the test needs the RPC layer.
    pub init_rpc: bool,
    /// How long a collective waits on a peer, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            world_size: TEST_DEVICE_NUM,
            backend: CommBackend::Local,
            init_rpc: false,
            timeout_ms: duration_millis(DEFAULT_TIMEOUT),
        }
    }
}

impl HarnessConfig {
    /// The default configuration, overridden by the `WORLD_SIZE`, `BACKEND` and
    /// `SHARD_TIMEOUT_MS` environment variables when they are set.
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, HarnessError> {
        let mut config = Self::default();

        if let Some(value) = var("WORLD_SIZE") {
            config.world_size = value
                .parse()
                .map_err(|_| HarnessError::Config(format!("WORLD_SIZE must be an integer, got '{value}'")))?;
        }
        if let Some(value) = var("BACKEND") {
            config.backend = value.parse()?;
        }
        if let Some(value) = var("SHARD_TIMEOUT_MS") {
            config.timeout_ms = value.parse().map_err(|_| {
                HarnessError::Config(format!("SHARD_TIMEOUT_MS must be an integer, got '{value}'"))
            })?;
        }

        Ok(config)
    }

    /// Parses a configuration from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, HarnessError> {
        serde_json::from_str(json).map_err(|err| HarnessError::Config(err.to_string()))
    }

    /// Sets the number of ranks.
    pub fn with_world_size(mut self, world_size: usize) -> Self {
        self.world_size = world_size;
        self
    }

    /// Sets the process group backend.
    pub fn with_backend(mut self, backend: CommBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets whether the RPC layer is needed.
    pub fn with_init_rpc(mut self, init_rpc: bool) -> Self {
        self.init_rpc = init_rpc;
        self
    }

    /// Sets the collective timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_millis(timeout);
        self
    }

    /// The collective timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A precondition of a multi-rank test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// At least `count` devices of `kind` must be present.
    MinDevices {
        /// The device kind.
        kind: DeviceKind,
        /// The minimum number of devices.
        count: usize,
    },
    /// The backend must be available.
    Backend(CommBackend),
    /// The RPC layer must be available.
    Rpc,
}

/// Why a test was skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Not enough devices of a kind.
    InsufficientDevices {
        /// The device kind.
        kind: DeviceKind,
        /// Devices the test needs.
        required: usize,
        /// Devices on this host.
        available: usize,
    },
    /// The backend is not available.
    BackendUnavailable(CommBackend),
    /// The RPC layer is not available.
    RpcUnavailable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InsufficientDevices {
                kind,
                required,
                available,
            } => write!(f, "need at least {required} {kind} device(s), found {available}"),
            SkipReason::BackendUnavailable(backend) => write!(f, "backend '{backend}' is not available"),
            SkipReason::RpcUnavailable => f.write_str("the RPC layer is not available"),
        }
    }
}

/// The result of a test that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every rank completed.
    Passed,
    /// A requirement was not met and no rank was started.
    Skipped(SkipReason),
}

/// Errors reported by [`MultiRankHarness::run`].
#[derive(thiserror::Error, Debug)]
pub enum HarnessError {
    /// The configuration is invalid.
    #[error("invalid harness config: {0}")]
    Config(String),
    /// The process group could not be created.
    #[error(transparent)]
    Comm(#[from] CommError),
    /// A rank returned an error.
    #[error("rank {rank} failed: {source}")]
    RankFailed {
        /// The failing rank.
        rank: usize,
        /// Its error.
        #[source]
        source: ShardError,
    },
    /// A rank panicked, usually on a failed assertion.
    #[error("rank {rank} panicked: {message}")]
    RankPanicked {
        /// The failing rank.
        rank: usize,
        /// The panic message.
        message: String,
    },
    /// The thread of a rank could not be spawned.
    #[error("failed to spawn rank {rank}: {message}")]
    Spawn {
        /// The rank.
        rank: usize,
        /// The OS error.
        message: String,
    },
}

impl HarnessError {
    /// Failures caused by another rank going away rather than by the rank itself.
    fn is_secondary(&self) -> bool {
        matches!(
            self,
            HarnessError::RankFailed {
                source: ShardError::Comm(CommError::Timeout { .. } | CommError::Disconnected { .. }),
                ..
            }
        )
    }
}

/// Runs a test body on every rank of a local process group.
///
/// # Example
///
/// ```rust,ignore
/// let outcome = MultiRankHarness::<B>::new(HarnessConfig::default(), devices)
///     .require_devices(DeviceKind::Cuda, TEST_DEVICE_NUM)
///     .require_backend(CommBackend::Nccl)
///     .run(|context| {
///         let st = ShardedTensor::<B, 2>::rand(spec.clone(), [12, 5], &context)?;
///         assert!(!st.deep_copy().shares_identity(&st));
///         Ok(())
///     })?;
/// ```
pub struct MultiRankHarness<B: Backend> {
    config: HarnessConfig,
    devices: Arc<dyn DeviceResolver<B>>,
    requirements: Vec<Requirement>,
}

impl<B: Backend> MultiRankHarness<B> {
    /// Creates a harness. Enabling `init_rpc` in the config adds [`Requirement::Rpc`].
    pub fn new(config: HarnessConfig, devices: Arc<dyn DeviceResolver<B>>) -> Self {
        let requirements = if config.init_rpc {
            vec![Requirement::Rpc]
        } else {
            Vec::new()
        };

        Self {
            config,
            devices,
            requirements,
        }
    }

    /// Skips the test when fewer than `count` devices of `kind` are present.
    pub fn require_devices(mut self, kind: DeviceKind, count: usize) -> Self {
        self.requirements.push(Requirement::MinDevices { kind, count });
        self
    }

    /// Skips the test when `backend` is not available.
    pub fn require_backend(mut self, backend: CommBackend) -> Self {
        self.requirements.push(Requirement::Backend(backend));
        self
    }

    /// The harness configuration.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The first unmet requirement, if any.
    pub fn unmet_requirement(&self) -> Option<SkipReason> {
        if !self.config.backend.is_available() {
            return Some(SkipReason::BackendUnavailable(self.config.backend));
        }

        self.requirements.iter().find_map(|requirement| match requirement {
            Requirement::Rpc => Some(SkipReason::RpcUnavailable),
            Requirement::Backend(backend) if !backend.is_available() => {
                Some(SkipReason::BackendUnavailable(*backend))
            }
            Requirement::MinDevices { kind, count } => {
                let available = self.devices.device_count(kind);
                (available < *count).then(|| SkipReason::InsufficientDevices {
                    kind: kind.clone(),
                    required: *count,
                    available,
                })
            }
            Requirement::Backend(_) => None,
        })
    }

    /// Runs `test` once per rank, each on its own thread, and waits for all of them.
    ///
    /// Returns [`RunOutcome::Skipped`] without starting any rank when a requirement
    /// is not met. When ranks fail, the first failure that is not a consequence of
    /// another rank failing is reported.
    pub fn run<F>(&self, test: F) -> Result<RunOutcome, HarnessError>
    where
        F: Fn(DistContext<B>) -> Result<(), ShardError> + Sync,
    {
        if let Some(reason) = self.unmet_requirement() {
            log::warn!("Skipping multi-rank test: {reason}");
            return Ok(RunOutcome::Skipped(reason));
        }

        let groups = ProcessGroup::new_local(
            self.config.world_size,
            self.config.backend,
            self.config.timeout(),
        )?;
        log::info!(
            "Running multi-rank test on {} rank(s) over {}",
            self.config.world_size,
            self.config.backend
        );

        let test = &test;
        let results: Vec<Result<(), HarnessError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    let rank = group.rank();
                    let context = DistContext::new(Arc::new(group), self.devices.clone());

                    std::thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || test(context))
                        .map(|handle| (rank, handle))
                        .map_err(|err| HarnessError::Spawn {
                            rank,
                            message: err.to_string(),
                        })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    let (rank, handle) = handle?;
                    match handle.join() {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(source)) => Err(HarnessError::RankFailed { rank, source }),
                        Err(panic) => Err(HarnessError::RankPanicked {
                            rank,
                            message: panic_message(panic.as_ref()),
                        }),
                    }
                })
                .collect()
        });

        let mut errors: Vec<HarnessError> = results.into_iter().filter_map(Result::err).collect();
        for err in &errors {
            log::error!("{err}");
        }

        match errors.iter().position(|err| !err.is_secondary()) {
            Some(idx) => Err(errors.swap_remove(idx)),
            None if !errors.is_empty() => Err(errors.swap_remove(0)),
            None => Ok(RunOutcome::Passed),
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}
