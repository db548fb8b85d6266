//! Explicit message passing between cooperating workers.
//!
//! Every worker owns a [`Communicator`] that is connected to every other worker of the same group
//! through one channel per ordered pair of workers. Workers share no mutable state: all data that
//! crosses a partition boundary goes through the collective operations defined here.
//!
//! All collective operations are SPMD: every worker of a group must call the same sequence of
//! collectives. Since channels are FIFO per worker pair, messages are matched by order alone.
use crate::Real;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::fmt;
use std::panic;

type Payload = Box<dyn Any + Send>;

/// Connection of one worker to all workers of its group.
///
/// # Panics
///
/// Collective operations panic if a peer worker has disconnected (for example because it
/// panicked), or if the workers of a group call collectives in different orders.
#[derive(Clone)]
pub struct Communicator {
    rank: usize,
    size: usize,
    // Indexed by destination rank
    senders: Vec<Sender<Payload>>,
    // Indexed by source rank
    receivers: Vec<Receiver<Payload>>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Communicator {
    /// A communicator for a single worker.
    pub fn serial() -> Self {
        Self::create_group(1)
            .pop()
            .expect("A group of size one has exactly one communicator")
    }

    /// Creates the communicators for a group of `size` workers, ordered by rank.
    pub fn create_group(size: usize) -> Vec<Self> {
        assert!(size > 0, "A worker group must have at least one worker.");

        // channels[source][dest]
        let mut senders = vec![Vec::with_capacity(size); size];
        let mut receivers = vec![Vec::with_capacity(size); size];
        for source in 0..size {
            for dest in 0..size {
                let (sender, receiver) = unbounded();
                senders[source].push(sender);
                receivers[dest].push((source, receiver));
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, mut receivers))| {
                receivers.sort_by_key(|(source, _)| *source);
                Self {
                    rank,
                    size,
                    senders,
                    receivers: receivers.into_iter().map(|(_, r)| r).collect(),
                }
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    fn send<M: Any + Send>(&self, dest: usize, message: M) {
        self.senders[dest]
            .send(Box::new(message))
            .unwrap_or_else(|_| panic!("Worker {} lost its connection to worker {}", self.rank, dest));
    }

    fn receive<M: Any + Send>(&self, source: usize) -> M {
        let payload = self.receivers[source]
            .recv()
            .unwrap_or_else(|_| panic!("Worker {} lost its connection to worker {}", self.rank, source));
        match payload.downcast::<M>() {
            Ok(message) => *message,
            Err(_) => panic!(
                "Worker {} received an unexpected message from worker {}. \
                 Collective operations must be called in the same order on all workers.",
                self.rank, source
            ),
        }
    }

    /// Blocks until all workers of the group have reached the barrier.
    pub fn barrier(&self) {
        self.all_gather(());
    }

    /// Gathers one value from every worker, ordered by rank, on every worker.
    pub fn all_gather<M: Clone + Any + Send>(&self, value: M) -> Vec<M> {
        for dest in (0..self.size).filter(|&dest| dest != self.rank) {
            self.send(dest, value.clone());
        }
        let mut own_value = Some(value);
        (0..self.size)
            .map(|source| {
                if source == self.rank {
                    own_value
                        .take()
                        .expect("Own value is only taken once")
                } else {
                    self.receive(source)
                }
            })
            .collect()
    }

    /// Personalized all-to-all exchange.
    ///
    /// `outgoing[dest]` is delivered to worker `dest`. The returned vector holds at index `source`
    /// the message sent by worker `source` to this worker.
    pub fn exchange<M: Any + Send>(&self, outgoing: Vec<M>) -> Vec<M> {
        assert_eq!(outgoing.len(), self.size, "Need exactly one message per worker.");
        let mut own_message = None;
        for (dest, message) in outgoing.into_iter().enumerate() {
            if dest == self.rank {
                own_message = Some(message);
            } else {
                self.send(dest, message);
            }
        }
        (0..self.size)
            .map(|source| {
                if source == self.rank {
                    own_message
                        .take()
                        .expect("Own message is only taken once")
                } else {
                    self.receive(source)
                }
            })
            .collect()
    }

    /// Sums `values` element-wise across all workers.
    ///
    /// Contributions are added in rank order, so every worker obtains bit-identical results.
    pub fn all_reduce_sum<T: Real>(&self, values: &mut [T]) {
        if self.size == 1 {
            return;
        }
        let contributions = self.all_gather(values.to_vec());
        values.fill(T::zero());
        for contribution in contributions {
            assert_eq!(contribution.len(), values.len(), "Reduced buffers must have equal lengths.");
            for (v, c) in values.iter_mut().zip(contribution) {
                *v += c;
            }
        }
    }

    pub fn all_reduce_scalar_sum<T: Real>(&self, value: T) -> T {
        let mut buffer = [value];
        self.all_reduce_sum(&mut buffer);
        buffer[0]
    }

    /// Maximum of `value` across all workers.
    pub fn all_reduce_max<M: PartialOrd + Clone + Any + Send>(&self, value: M) -> M {
        self.all_gather(value)
            .into_iter()
            .reduce(|a, b| if b > a { b } else { a })
            .expect("Group is never empty")
    }

    /// Returns `true` on every worker if `flag` is `true` on at least one worker.
    pub fn all_reduce_or(&self, flag: bool) -> bool {
        self.all_gather(flag).into_iter().any(|f| f)
    }

    /// Exclusive prefix sum of `count` in rank order, together with the global total.
    pub fn exclusive_scan(&self, count: usize) -> (usize, usize) {
        let counts = self.all_gather(count);
        let offset = counts[..self.rank].iter().sum();
        let total = counts.iter().sum();
        (offset, total)
    }
}

/// Runs `f` on `num_workers` concurrent workers and returns their results ordered by rank.
///
/// Each worker receives its own [`Communicator`]. If any worker panics, the panic is propagated
/// to the caller once all workers have finished.
pub fn run_workers<R, F>(num_workers: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(Communicator) -> R + Sync,
{
    let communicators = Communicator::create_group(num_workers);
    let f = &f;
    let result = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = communicators
            .into_iter()
            .map(|comm| scope.spawn(move |_| f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    });

    match result {
        Ok(results) => results
            .into_iter()
            .map(|result| result.unwrap_or_else(|payload| panic::resume_unwind(payload)))
            .collect(),
        Err(payload) => panic::resume_unwind(payload),
    }
}
