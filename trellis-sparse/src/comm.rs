//! In-process message passing between ranks.
//!
//! Every rank runs on its own thread and owns a [`Communicator`]. Point-to-point messages are
//! tagged with the epoch of the collective they belong to, so ranks only need to agree on the
//! order in which they enter collectives.
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use nalgebra::DVector;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use trellis_traits::Real;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(300);

struct Envelope {
    source: usize,
    epoch: u64,
    payload: Box<dyn Any + Send>,
}

struct Endpoint {
    rank: usize,
    size: usize,
    senders: Vec<Sender<Envelope>>,
    receiver: Receiver<Envelope>,
    // Messages that arrived ahead of the collective that consumes them
    pending: Mutex<Vec<Envelope>>,
    epoch: AtomicU64,
    aborted: Arc<AtomicBool>,
}

/// Handle to the communication endpoint of a single rank.
///
/// Cloning is cheap and all clones share the same endpoint. All collective operations must be
/// entered by every rank of the group in the same order.
#[derive(Clone)]
pub struct Communicator {
    endpoint: Arc<Endpoint>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .finish()
    }
}

impl Communicator {
    /// A communicator for a group consisting of a single rank.
    pub fn serial() -> Self {
        Self::group(1)
            .pop()
            .expect("group of size 1 has exactly one communicator")
    }

    fn group(size: usize) -> Vec<Self> {
        assert!(size > 0, "a communicator group needs at least one rank");
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        let aborted = Arc::new(AtomicBool::new(false));
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| Self {
                endpoint: Arc::new(Endpoint {
                    rank,
                    size,
                    senders: senders.clone(),
                    receiver,
                    pending: Mutex::new(Vec::new()),
                    epoch: AtomicU64::new(0),
                    aborted: aborted.clone(),
                }),
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.endpoint.rank
    }

    pub fn size(&self) -> usize {
        self.endpoint.size
    }

    pub fn is_root(&self) -> bool {
        self.rank() == 0
    }

    fn next_epoch(&self) -> u64 {
        self.endpoint.epoch.fetch_add(1, Ordering::Relaxed)
    }

    fn send<M: Send + 'static>(&self, destination: usize, epoch: u64, message: M) {
        let envelope = Envelope {
            source: self.rank(),
            epoch,
            payload: Box::new(message),
        };
        if self.endpoint.senders[destination].send(envelope).is_err() {
            panic!("rank {} is unreachable from rank {}", destination, self.rank());
        }
    }

    fn receive<M: 'static>(&self, source: usize, epoch: u64) -> M {
        let envelope = self.receive_envelope(source, epoch);
        match envelope.payload.downcast::<M>() {
            Ok(message) => *message,
            Err(_) => panic!(
                "rank {} received a payload of unexpected type from rank {} (epoch {})",
                self.rank(),
                source,
                epoch
            ),
        }
    }

    fn receive_envelope(&self, source: usize, epoch: u64) -> Envelope {
        {
            let mut pending = self.endpoint.pending.lock();
            if let Some(pos) = pending
                .iter()
                .position(|e| e.source == source && e.epoch == epoch)
            {
                return pending.swap_remove(pos);
            }
        }

        let start = Instant::now();
        loop {
            match self.endpoint.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(envelope) if envelope.source == source && envelope.epoch == epoch => return envelope,
                Ok(envelope) => self.endpoint.pending.lock().push(envelope),
                Err(RecvTimeoutError::Timeout) => {
                    if self.endpoint.aborted.load(Ordering::Acquire) {
                        panic!("rank {} aborting: another rank panicked", self.rank());
                    }
                    if start.elapsed() > COLLECTIVE_TIMEOUT {
                        panic!(
                            "rank {} timed out waiting for rank {} in collective {}",
                            self.rank(),
                            source,
                            epoch
                        );
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("communication channel of rank {} disconnected", self.rank())
                }
            }
        }
    }

    /// Blocks until every rank has entered the barrier.
    pub fn barrier(&self) {
        self.all_gather(());
    }

    /// Collects one value from every rank, ordered by rank.
    pub fn all_gather<M: Clone + Send + 'static>(&self, value: M) -> Vec<M> {
        let epoch = self.next_epoch();
        for destination in (0..self.size()).filter(|&r| r != self.rank()) {
            self.send(destination, epoch, value.clone());
        }
        let mut own = Some(value);
        (0..self.size())
            .map(|source| {
                if source == self.rank() {
                    own.take().expect("own value is taken exactly once")
                } else {
                    self.receive(source, epoch)
                }
            })
            .collect()
    }

    /// Sends `outgoing[r]` to rank `r` and returns the messages received from every rank,
    /// ordered by source rank.
    pub fn all_to_all<M: Send + 'static>(&self, outgoing: Vec<M>) -> Vec<M> {
        assert_eq!(outgoing.len(), self.size(), "need exactly one message per rank");
        let epoch = self.next_epoch();
        let mut own = None;
        for (destination, message) in outgoing.into_iter().enumerate() {
            if destination == self.rank() {
                own = Some(message);
            } else {
                self.send(destination, epoch, message);
            }
        }
        (0..self.size())
            .map(|source| {
                if source == self.rank() {
                    own.take().expect("own message is taken exactly once")
                } else {
                    self.receive(source, epoch)
                }
            })
            .collect()
    }

    /// Sparse neighborhood exchange.
    ///
    /// Sends each `(destination, message)` pair and returns one message from every rank in
    /// `sources`, in the order given. Every rank of the group must call this, including ranks
    /// with no neighbors.
    pub fn exchange<M: Send + 'static>(&self, outgoing: Vec<(usize, M)>, sources: &[usize]) -> Vec<M> {
        let epoch = self.next_epoch();
        for (destination, message) in outgoing {
            self.send(destination, epoch, message);
        }
        sources
            .iter()
            .map(|&source| self.receive(source, epoch))
            .collect()
    }

    /// Global sum, accumulated in rank order so that every rank obtains the same bits.
    pub fn all_reduce_sum<T: Real>(&self, value: T) -> T {
        self.all_gather(value)
            .into_iter()
            .fold(T::zero(), |sum, x| sum + x)
    }

    /// Global elementwise sum of replicated vectors, accumulated in rank order.
    pub fn all_reduce_sum_vector<T: Real>(&self, value: &DVector<T>) -> DVector<T> {
        let contributions = self.all_gather(value.clone());
        let mut sum = DVector::zeros(value.len());
        for contribution in &contributions {
            assert_eq!(contribution.len(), sum.len(), "vector lengths differ between ranks");
            sum += contribution;
        }
        sum
    }

    pub fn all_reduce_max<T: Real>(&self, value: T) -> T {
        self.all_gather(value)
            .into_iter()
            .fold(T::min_value().unwrap_or(value), |max, x| max.max(x))
    }

    pub fn all_reduce_sum_usize(&self, value: usize) -> usize {
        self.all_gather(value).into_iter().sum()
    }

    /// Returns `true` on every rank if any rank passes `true`.
    pub fn any(&self, flag: bool) -> bool {
        self.all_gather(flag).into_iter().any(|f| f)
    }
}

/// Sets the shared abort flag when a rank thread unwinds.
struct AbortOnPanic(Arc<AtomicBool>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

/// Launches groups of ranks, each on its own thread.
#[derive(Debug, Clone, Copy)]
pub struct Universe;

impl Universe {
    /// Runs `f` on `size` ranks and returns the results ordered by rank.
    ///
    /// If any rank panics, the remaining ranks abort at their next blocking point and the panic
    /// is propagated to the caller.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(Communicator) -> R + Sync,
    {
        let communicators = Communicator::group(size);
        std::thread::scope(|scope| {
            let handles: Vec<_> = communicators
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    let guard = AbortOnPanic(comm.endpoint.aborted.clone());
                    std::thread::Builder::new()
                        .name(format!("rank-{}", comm.rank()))
                        .spawn_scoped(scope, move || {
                            let _guard = guard;
                            f(comm)
                        })
                        .expect("failed to spawn rank thread")
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}
