use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use hashbrown::HashMap;

use super::{CommBackend, CommError};

/// Default time a rank waits on a peer before a collective fails.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type Payload = Box<dyn Any + Send>;

struct Envelope {
    seq: u64,
    src: usize,
    payload: Payload,
}

/// One rank's handle on a group of cooperating ranks.
///
/// Collectives must be issued in the same order on every rank of the group. Each
/// collective gets a sequence number, so messages from a fast peer that is already
/// one collective ahead are buffered until they are asked for.
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    backend: CommBackend,
    timeout: Duration,
    /// Links to every other rank, `None` at our own index.
    peers: Vec<Option<Sender<Envelope>>>,
    inbox: Receiver<Envelope>,
    pending: Mutex<HashMap<(u64, usize), Payload>>,
    seq: AtomicU64,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("backend", &self.backend)
            .finish()
    }
}

impl ProcessGroup {
    /// Creates a fully connected group of `world_size` ranks living in this process.
    ///
    /// The returned vector is indexed by rank. Each handle is meant to be moved to
    /// the thread running that rank.
    pub fn new_local(
        world_size: usize,
        backend: CommBackend,
        timeout: Duration,
    ) -> Result<Vec<ProcessGroup>, CommError> {
        if !backend.is_available() {
            return Err(CommError::BackendUnavailable(backend));
        }
        if world_size == 0 {
            return Err(CommError::EmptyGroup);
        }

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();

        let groups = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| {
                let peers = senders
                    .iter()
                    .enumerate()
                    .map(|(peer, sender)| (peer != rank).then(|| sender.clone()))
                    .collect();

                ProcessGroup {
                    rank,
                    world_size,
                    backend,
                    timeout,
                    peers,
                    inbox,
                    pending: Mutex::new(HashMap::new()),
                    seq: AtomicU64::new(0),
                }
            })
            .collect();

        log::debug!("Created local process group of {world_size} rank(s) on {backend}");

        Ok(groups)
    }

    /// A group holding only the calling rank.
    pub fn single() -> ProcessGroup {
        let (_, inbox) = unbounded();

        ProcessGroup {
            rank: 0,
            world_size: 1,
            backend: CommBackend::Local,
            timeout: DEFAULT_TIMEOUT,
            peers: vec![None],
            inbox,
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// The rank of this handle.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the group.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// The backend the group runs on.
    pub fn backend(&self) -> CommBackend {
        self.backend
    }

    /// How long a collective waits on a peer.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Gathers one value from every rank, on every rank. The result is indexed by rank.
    pub fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>, CommError> {
        let seq = self.next_seq();
        log::trace!("rank {} all_gather #{seq}", self.rank);

        for dst in self.other_ranks() {
            self.send(dst, seq, value.clone())?;
        }

        let mut own = Some(value);
        (0..self.world_size)
            .map(|src| {
                if src == self.rank {
                    own.take().ok_or(CommError::MissingRootPayload { rank: src })
                } else {
                    self.recv(src, seq)
                }
            })
            .collect()
    }

    /// Gathers one value from every rank on `dst`. Other ranks get `None`.
    pub fn gather<T: Send + 'static>(&self, value: T, dst: usize) -> Result<Option<Vec<T>>, CommError> {
        self.check_rank(dst)?;
        let seq = self.next_seq();
        log::trace!("rank {} gather #{seq} to {dst}", self.rank);

        if self.rank != dst {
            self.send(dst, seq, value)?;
            return Ok(None);
        }

        let mut own = Some(value);
        (0..self.world_size)
            .map(|src| {
                if src == self.rank {
                    own.take().ok_or(CommError::MissingRootPayload { rank: src })
                } else {
                    self.recv(src, seq)
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Sends `values[r]` from `src` to each rank `r`. Only `src` provides values.
    pub fn scatter<T: Send + 'static>(&self, values: Option<Vec<T>>, src: usize) -> Result<T, CommError> {
        self.check_rank(src)?;
        let seq = self.next_seq();
        log::trace!("rank {} scatter #{seq} from {src}", self.rank);

        if self.rank != src {
            return self.recv(src, seq);
        }

        let values = values.ok_or(CommError::MissingRootPayload { rank: src })?;
        if values.len() != self.world_size {
            return Err(CommError::ScatterLength {
                expected: self.world_size,
                actual: values.len(),
            });
        }

        let mut own = None;
        for (dst, value) in values.into_iter().enumerate() {
            if dst == self.rank {
                own = Some(value);
            } else {
                self.send(dst, seq, value)?;
            }
        }

        own.ok_or(CommError::MissingRootPayload { rank: src })
    }

    /// Sends the value held by `src` to every rank.
    pub fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>, src: usize) -> Result<T, CommError> {
        self.check_rank(src)?;
        let seq = self.next_seq();
        log::trace!("rank {} broadcast #{seq} from {src}", self.rank);

        if self.rank != src {
            return self.recv(src, seq);
        }

        let value = value.ok_or(CommError::MissingRootPayload { rank: src })?;
        for dst in self.other_ranks() {
            self.send(dst, seq, value.clone())?;
        }

        Ok(value)
    }

    /// Blocks until every rank reached the barrier.
    pub fn barrier(&self) -> Result<(), CommError> {
        self.all_gather(()).map(|_| ())
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn other_ranks(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.world_size).filter(move |&peer| peer != self.rank)
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.world_size {
            return Err(CommError::InvalidRank {
                rank,
                world_size: self.world_size,
            });
        }

        Ok(())
    }

    fn send<T: Send + 'static>(&self, dst: usize, seq: u64, value: T) -> Result<(), CommError> {
        let sender = self
            .peers
            .get(dst)
            .and_then(Option::as_ref)
            .ok_or(CommError::InvalidRank {
                rank: dst,
                world_size: self.world_size,
            })?;

        sender
            .send(Envelope {
                seq,
                src: self.rank,
                payload: Box::new(value),
            })
            .map_err(|_| CommError::Disconnected { peer: dst })
    }

    fn recv<T: 'static>(&self, src: usize, seq: u64) -> Result<T, CommError> {
        let payload = self.recv_payload(src, seq)?;

        payload
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| CommError::TypeMismatch { src, seq })
    }

    fn recv_payload(&self, src: usize, seq: u64) -> Result<Payload, CommError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(payload) = pending.remove(&(seq, src)) {
            return Ok(payload);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(remaining) {
                Ok(envelope) if envelope.seq == seq && envelope.src == src => {
                    return Ok(envelope.payload);
                }
                Ok(envelope) => {
                    pending.insert((envelope.seq, envelope.src), envelope.payload);
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("rank {} timed out waiting for rank {src} (#{seq})", self.rank);
                    return Err(CommError::Timeout { src, seq });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected { peer: src });
                }
            }
        }
    }
}
